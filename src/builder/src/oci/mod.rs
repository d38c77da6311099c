//! OCI image composition.
//!
//! Builds the final image in memory: a config file (labels, history,
//! diff-ids) plus an ordered list of gzip-compressed tar layers. Layers
//! are semantically named through their history comments, which is how a
//! parent image's kernel and initrd layers are recognized and reused.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 Assembled image               │
//! │                                               │
//! │  history comment          layer               │
//! │  "Base OS Layer"          rootfs tar.gz       │
//! │  "Configuration Layer"    etc/image-config    │
//! │  "Kernel Layer"           boot/vmlinuz        │
//! │  "Initrd Layer"           boot/initrd.img     │
//! └───────────────────────────────────────────────┘
//! ```

pub mod archive;
pub mod assembler;
pub mod config;
pub mod layer;
pub mod reference;
pub mod registry;

pub use archive::{load_docker_archive, SeedImage};
pub use assembler::ImageAssembler;
pub use config::{HistoryEntry, ImageConfigFile};
pub use layer::LayerBlob;
pub use registry::{DistributionTransport, PushableImage, RegistryTransport};
