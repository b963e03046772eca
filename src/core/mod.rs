pub mod link;
pub mod registry;
pub mod supervisor;
