pub mod ingress;
pub mod probe;
pub mod protocol;
