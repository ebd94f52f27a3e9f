mod address;
mod domain;
mod localpart;
mod validator;

pub use address::*;
pub use domain::*;
pub use localpart::*;
pub use validator::*;
