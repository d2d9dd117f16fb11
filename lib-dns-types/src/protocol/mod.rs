pub mod deserialise;
pub mod edns;
pub mod serialise;
pub mod types;
