pub mod approval;
pub mod capabilities;
pub mod ingest;
pub mod planning;
pub mod prompts;
pub mod repair;
pub mod scoring;
pub mod selection;
pub mod settings;
pub mod state;
pub mod tool_adapters;
pub mod workflow;
