use redb::TableDefinition;

/// Entity records: "{kind}/{id}" -> EntityRecord (msgpack)
pub const ENTITIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entities");
