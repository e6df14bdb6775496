pub mod gemini;
pub mod local_ops;
