pub mod deserialise;
pub mod document;
pub mod serialise;
pub mod types;
