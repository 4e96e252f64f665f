//! Traits at the collaborator seams

pub mod llm;

pub use llm::LanguageModel;
