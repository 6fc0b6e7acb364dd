use redb::TableDefinition;

/// File records: uuid -> FileRecord (msgpack)
pub const FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("files");

/// Owner index: owner_id -> msgpack Vec of file UUIDs
pub const OWNER_FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("owner_files");

/// Pending index: uuid -> () for every record with sync_status = pending
pub const PENDING_FILES: TableDefinition<&str, ()> = TableDefinition::new("pending_files");
