use schemars::JsonSchema;

fn main() -> anyhow::Result<()> {
    let mut gen = schemars::gen::SchemaSettings::openapi3()
        .with(|s| {
            s.inline_subschemas = true;
            s.meta_schema = None;
        })
        .with_visitor(kube::core::schema::StructuralSchemaRewriter)
        .into_generator();
    print!(
        "{}",
        serde_json::to_string_pretty(
            &cloudsap::resources::cloudserviceaccounts::CloudServiceAccount::json_schema(&mut gen)
        )?
    );
    Ok(())
}
