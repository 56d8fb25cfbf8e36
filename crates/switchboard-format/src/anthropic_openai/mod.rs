pub mod request;
pub mod response;
pub mod stream;
pub mod wire;

pub use request::{build_request_body, is_reasoning_capable};
pub use response::convert_response;
pub use stream::StreamTranslator;
