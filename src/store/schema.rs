pub(super) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sources (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    url TEXT NOT NULL,
    metadata TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    last_checked INTEGER,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS raw_items (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL,
    external_id TEXT NOT NULL,
    url TEXT NOT NULL,
    title TEXT NOT NULL,
    kind TEXT NOT NULL,
    metadata TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    published_at INTEGER,
    discovered_at INTEGER NOT NULL,
    UNIQUE (source_id, external_id)
);
CREATE INDEX IF NOT EXISTS idx_raw_items_status ON raw_items (status);

CREATE TABLE IF NOT EXISTS contents (
    id TEXT PRIMARY KEY,
    raw_item_id TEXT NOT NULL UNIQUE,
    text TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    lang TEXT,
    extracted_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_contents_hash ON contents (content_hash);

CREATE TABLE IF NOT EXISTS stories (
    id TEXT PRIMARY KEY,
    content_id TEXT NOT NULL UNIQUE,
    content_hash TEXT NOT NULL UNIQUE,
    canonical_url TEXT NOT NULL,
    title TEXT NOT NULL,
    published_at INTEGER,
    cluster_key TEXT NOT NULL,
    analysis TEXT,
    analyzed_at INTEGER,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS story_observations (
    story_id TEXT NOT NULL,
    content_id TEXT NOT NULL,
    observed_at INTEGER NOT NULL,
    PRIMARY KEY (story_id, content_id)
);

CREATE TABLE IF NOT EXISTS quota_usage (
    provider TEXT NOT NULL,
    operation TEXT NOT NULL,
    units INTEGER NOT NULL,
    metadata TEXT,
    recorded_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_quota_usage_provider ON quota_usage (provider, recorded_at);

CREATE TABLE IF NOT EXISTS quota_snapshots (
    provider TEXT PRIMARY KEY,
    used INTEGER NOT NULL,
    remaining INTEGER NOT NULL,
    daily_limit INTEGER NOT NULL,
    reset_at INTEGER NOT NULL,
    recorded_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    queue TEXT NOT NULL,
    payload TEXT NOT NULL,
    state TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    retry_limit INTEGER NOT NULL,
    retry_delay_ms INTEGER NOT NULL,
    start_after INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    keepalive_at INTEGER,
    completed_at INTEGER,
    output TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_fetch ON jobs (queue, state, start_after);

CREATE TABLE IF NOT EXISTS schedules (
    name TEXT PRIMARY KEY,
    queue TEXT NOT NULL,
    cron TEXT NOT NULL,
    timezone TEXT NOT NULL,
    payload TEXT NOT NULL,
    last_fired_at INTEGER,
    created_at INTEGER NOT NULL
);
"#;
