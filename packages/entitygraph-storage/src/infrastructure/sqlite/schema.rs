//! SQLite schema for the canonical entity graph

pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS entities (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    name          TEXT    NOT NULL,
    slug          TEXT    NOT NULL UNIQUE,
    entity_type   TEXT    NOT NULL,
    schema_type   TEXT,
    description   TEXT,
    same_as_url   TEXT,
    external_id   TEXT,
    status        TEXT    NOT NULL DEFAULT 'raw',
    mention_count INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT    NOT NULL,
    updated_at    TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS entity_aliases (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id   INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    alias       TEXT    NOT NULL,
    alias_slug  TEXT    NOT NULL UNIQUE,
    source      TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_aliases_entity ON entity_aliases(entity_id);

CREATE TABLE IF NOT EXISTS entity_mentions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id   INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    document_id INTEGER NOT NULL,
    confidence  REAL    NOT NULL,
    context     TEXT,
    is_primary  INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT    NOT NULL,
    UNIQUE (entity_id, document_id)
);

CREATE INDEX IF NOT EXISTS idx_mentions_document ON entity_mentions(document_id);

CREATE TABLE IF NOT EXISTS entity_redirects (
    from_id INTEGER PRIMARY KEY,
    to_id   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS kv_store (
    key   TEXT PRIMARY KEY,
    value BLOB NOT NULL
);
"#;
