#[cfg(feature = "integration_egon")]
pub mod egon;
