pub mod cursor;
pub mod map;
pub mod page;
pub mod types;
pub(crate) mod write;

pub use cursor::BTreeCursor;
pub use map::BTreeMap;
pub use page::{LeafPage, NodePage, Page, PageKey, PageRef, RemotePage};
pub use types::{ByteReader, KeyType, RecordType};
