mod directory;
mod entry;
mod entry_store;
mod value;

pub use directory::{list_entries, list_tables, Table, PATH_SEPARATOR};
pub use entry::{Entry, EntryFlags, Writer};
pub use entry_store::{EntryStore, Rejection};
pub use value::{Value, ValueType};
