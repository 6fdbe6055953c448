pub mod atlas;
pub mod error;
pub mod geometry;
pub mod optimizer;
pub mod semantic;
pub mod system;
