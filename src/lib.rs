pub mod config;
pub mod convert;
pub mod decode;
pub mod fetch;
pub mod pipeline;
pub mod schema;
pub mod source;
pub mod util;
pub mod writer;
