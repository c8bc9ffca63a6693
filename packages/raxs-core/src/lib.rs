#![forbid(unsafe_code)]
//! Versioned, random-access XML tree store.
//! Documents are opened through a byte-range index and loaded node by node; edits go
//! through a copy-on-write change buffer, and every commit keeps a reverse delta so
//! older versions can be rebuilt from the current one.

pub mod change_buffer;
pub mod config;
pub mod encode;
pub mod error;
pub mod fragment;
pub mod index;
pub mod key;
pub mod model;
pub mod reftrees;
pub mod store;
pub mod traits;
pub mod tree;
pub mod version;
pub mod versioned;
pub mod view;
pub mod xml;

pub use change_buffer::{ChangeBuffer, SessionId, SessionToken};
pub use config::StoreConfig;
pub use encode::{read_ref_tree, write_ref_tree, DocumentEncoder, EncodeStats};
pub use error::{Error, Result};
pub use fragment::{FragmentState, LazySource};
pub use index::{Entry, Index};
pub use key::{DeweyKey, Key};
pub use model::{
    AttributeIdentification, Content, ContentCodec, ElementCodec, IdentificationModel,
    ItemCodec, KeyKind, ModelRegistry, PositionalIdentification, TreeModel, DEWEY_MODEL,
    ID_MODEL,
};
pub use reftrees::{combine, reverse_ref_tree};
pub use store::Store;
pub use traits::{IoTrap, LoggingTrap, MutableRefTree, Position, RefTree};
pub use tree::{materialize, snapshot, MemTree, NodeSnapshot, Payload, RefNode, TreeSnapshot};
pub use version::{
    Version, VersionHistory, CURRENT_VERSION, FIRST_VERSION, MAX_VERSION, NO_VERSION,
};
pub use versioned::VersionedStore;
pub use view::IndexedTree;
