pub mod build;
pub mod deploy;
pub mod domain;
pub mod envelope;
pub mod error;
pub mod simulate;
