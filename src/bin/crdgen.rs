//! CRD YAML Generator
//!
//! This binary generates Kubernetes CRD manifests for the custom resources
//! owned by the oadp-operator.
//!
//! Usage: cargo run --bin crdgen > config/crd/all.yaml

use oadp_operator::crd::generate_crds;

fn main() -> anyhow::Result<()> {
    for crd in generate_crds()? {
        println!("---");
        print!("{}", crd);
    }
    Ok(())
}
