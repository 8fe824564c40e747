pub mod cache;
pub mod deepl;
pub mod google;
pub mod provider;
pub mod stage;

pub use cache::TranslationCache;
pub use deepl::DeepLTranslator;
pub use google::GoogleTranslator;
pub use provider::{TranslationCall, TranslationProvider};
pub use stage::{skip_reason, SkipReason, TranslationStage};
