pub mod manifest;
pub mod reqname;

pub use manifest::{
    load_manifest, should_iterate, store_manifest, CurrentService, Manifest, ManifestError,
    MaxRep, Service, STOP_MARKER,
};
