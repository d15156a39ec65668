pub mod error;
pub mod event;
pub mod message;
pub mod request;
pub mod response;


pub use error::{FramelinkError, Result};
pub use event::Event;
pub use message::{Kind, Manifest, Method, PROTOCOL_NAME, PROTOCOL_VERSION};
pub use request::Request;
pub use response::Response;
