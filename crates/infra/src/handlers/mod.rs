//! Concrete job handlers, one per job type, with their collaborator traits.

pub mod backup;
pub mod email_send;
pub mod price_sync;

pub use backup::{
    ArtifactStorage, BackupHandler, BackupSource, FilesystemArtifactStorage,
    InMemoryArtifactStorage, InMemoryBackupSource, PostgresBackupSource,
};
pub use email_send::{
    EmailMessage, EmailSendHandler, EmailTransport, LogEmailTransport, RecordingEmailTransport,
};
pub use price_sync::{
    HttpPriceSource, InMemoryPriceCatalog, PostgresPriceCatalog, PriceCatalog, PriceFetchError,
    PriceQuote, PriceSource, PriceSyncHandler, StaticPriceSource, TrackedProduct,
    UnconfiguredPriceSource,
};
