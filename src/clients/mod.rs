pub mod aws;
pub mod iam;
pub mod kubernetes;

#[cfg(test)]
pub mod fakes;

pub use iam::{AwsIam, IamApi, IamError, Role};
pub use kubernetes::{KubeApi, KubeClient, Listing, WatchStream};
