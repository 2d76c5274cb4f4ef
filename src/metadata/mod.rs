//! Provenance metadata embedded in dump artifacts.

pub mod codec;
pub mod providers;

pub use codec::{DumpMetadata, MetadataCodec, MetadataShape};
pub use providers::{
    MetadataCollector, MetadataProvider, ProviderContext, ProviderRegistry, DEFAULT_PROVIDERS,
};
