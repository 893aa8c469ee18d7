mod echo_engine;

pub use echo_engine::{encode_document, parse_document, EchoEngine};
