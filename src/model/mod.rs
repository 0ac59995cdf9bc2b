pub mod catalog;
pub mod fields;
pub mod request;
pub mod transaction;

pub use catalog::*;
pub use fields::*;
pub use request::*;
pub use transaction::*;
