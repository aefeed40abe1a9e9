pub mod cloudserviceaccounts;
