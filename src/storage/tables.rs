use redb::TableDefinition;

/// Reference markers: "<content hash>/<logical path id>" -> ()
///
/// Keys sort by content hash first, so all markers of one blob form a
/// contiguous range.
pub const REFERENCES: TableDefinition<&str, ()> = TableDefinition::new("references");
