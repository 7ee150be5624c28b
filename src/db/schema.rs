// src/db/schema.rs
//
// Schema for the reconciliation engine (spec §3). Applied with
// `execute_batch`, the same way the teacher's `init_db` applies a
// schema file — kept as a string constant here since there's no
// migration framework in scope.

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS buildings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    normalized_name TEXT NOT NULL,
    canonical_name TEXT NOT NULL,
    address TEXT,
    normalized_address TEXT,
    total_floors INTEGER,
    basement_floors INTEGER,
    total_units INTEGER,
    built_year INTEGER,
    built_month INTEGER,
    construction_type TEXT,
    land_rights TEXT,
    station_info TEXT,
    latitude REAL,
    longitude REAL,
    geocoded_at TEXT,
    is_valid_name INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_buildings_canonical_name ON buildings(canonical_name);

CREATE TABLE IF NOT EXISTS building_listing_names (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    building_id INTEGER NOT NULL REFERENCES buildings(id) ON DELETE CASCADE,
    normalized_name TEXT NOT NULL,
    canonical_name TEXT NOT NULL,
    source_sites TEXT NOT NULL DEFAULT '',
    occurrence_count INTEGER NOT NULL DEFAULT 0,
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    UNIQUE(building_id, normalized_name)
);
CREATE INDEX IF NOT EXISTS idx_bln_canonical_name ON building_listing_names(canonical_name);

CREATE TABLE IF NOT EXISTS master_properties (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    building_id INTEGER NOT NULL REFERENCES buildings(id) ON DELETE CASCADE,
    room_number TEXT,
    floor_number INTEGER,
    area REAL,
    balcony_area REAL,
    layout TEXT,
    direction TEXT,
    display_building_name TEXT,
    current_price INTEGER,
    sold_at TEXT,
    final_price INTEGER,
    final_price_updated_at TEXT,
    earliest_listing_date TEXT,
    management_fee INTEGER,
    repair_fund INTEGER,
    station_info TEXT,
    parking_info TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
-- Partial unique index: identity key only binds when room_number is absent
-- (spec §3: "identity key is the composite ... when room_number is null").
CREATE UNIQUE INDEX IF NOT EXISTS uq_master_property_key_no_room
    ON master_properties(building_id, floor_number, area, layout, direction)
    WHERE room_number IS NULL;
CREATE UNIQUE INDEX IF NOT EXISTS uq_master_property_key_room
    ON master_properties(building_id, room_number)
    WHERE room_number IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_master_properties_building ON master_properties(building_id);

CREATE TABLE IF NOT EXISTS listings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    master_property_id INTEGER NOT NULL REFERENCES master_properties(id) ON DELETE CASCADE,
    source_site TEXT NOT NULL,
    site_property_id TEXT NOT NULL,
    url TEXT NOT NULL,
    listing_building_name TEXT NOT NULL,
    listing_address TEXT,
    listing_floor_number INTEGER,
    listing_area REAL,
    listing_layout TEXT,
    listing_direction TEXT,
    listing_total_floors INTEGER,
    listing_built_year INTEGER,
    listing_built_month INTEGER,
    listing_balcony_area REAL,
    listing_total_units INTEGER,
    listing_basement_floors INTEGER,
    listing_land_rights TEXT,
    listing_station_info TEXT,
    listing_building_structure TEXT,
    listing_parking_info TEXT,
    current_price INTEGER,
    management_fee INTEGER,
    repair_fund INTEGER,
    agency_name TEXT,
    agency_tel TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    has_update_mark INTEGER NOT NULL DEFAULT 0,
    first_seen_at TEXT NOT NULL,
    first_published_at TEXT,
    published_at TEXT,
    last_scraped_at TEXT NOT NULL,
    last_confirmed_at TEXT NOT NULL,
    last_fetched_at TEXT,
    price_updated_at TEXT,
    delisted_at TEXT,
    detail_fetched_at TEXT,
    UNIQUE(source_site, site_property_id)
);
CREATE INDEX IF NOT EXISTS idx_listings_property ON listings(master_property_id);
CREATE INDEX IF NOT EXISTS idx_listings_active ON listings(is_active);

CREATE TABLE IF NOT EXISTS listing_price_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    listing_id INTEGER NOT NULL REFERENCES listings(id) ON DELETE CASCADE,
    recorded_at TEXT NOT NULL,
    price INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_lph_listing ON listing_price_history(listing_id, recorded_at);

CREATE TABLE IF NOT EXISTS property_price_changes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    master_property_id INTEGER NOT NULL REFERENCES master_properties(id) ON DELETE CASCADE,
    change_date TEXT NOT NULL,
    old_price INTEGER,
    new_price INTEGER,
    price_diff INTEGER,
    price_diff_rate REAL,
    new_price_votes INTEGER NOT NULL,
    old_price_votes INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ppc_property ON property_price_changes(master_property_id, change_date);

CREATE TABLE IF NOT EXISTS property_price_change_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    master_property_id INTEGER NOT NULL REFERENCES master_properties(id) ON DELETE CASCADE,
    status TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER NOT NULL DEFAULT 5,
    reason TEXT NOT NULL,
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ppcq_status_priority ON property_price_change_queue(status, priority);
CREATE UNIQUE INDEX IF NOT EXISTS uq_ppcq_pending_property
    ON property_price_change_queue(master_property_id)
    WHERE status = 'pending';

CREATE TABLE IF NOT EXISTS building_merge_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    direct_primary_building_id INTEGER NOT NULL,
    final_primary_building_id INTEGER NOT NULL,
    merged_building_id INTEGER NOT NULL,
    merge_depth INTEGER NOT NULL DEFAULT 0,
    merge_details TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_bmh_final_primary ON building_merge_history(final_primary_building_id);
CREATE INDEX IF NOT EXISTS idx_bmh_merged ON building_merge_history(merged_building_id);

CREATE TABLE IF NOT EXISTS property_merge_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    direct_primary_property_id INTEGER NOT NULL,
    final_primary_property_id INTEGER NOT NULL,
    merged_property_id INTEGER NOT NULL,
    merge_depth INTEGER NOT NULL DEFAULT 0,
    merge_details TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pmh_final_primary ON property_merge_history(final_primary_property_id);
CREATE INDEX IF NOT EXISTS idx_pmh_merged ON property_merge_history(merged_property_id);

CREATE TABLE IF NOT EXISTS building_merge_exclusions (
    id1 INTEGER NOT NULL,
    id2 INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (id1, id2)
);

CREATE TABLE IF NOT EXISTS property_merge_exclusions (
    id1 INTEGER NOT NULL,
    id2 INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (id1, id2)
);

-- Supplemental to spec §3 (SPEC_FULL §B): some sources expose a stable
-- per-building id distinct from the per-listing id. When present this
-- short-circuits the name/address building match in identity resolution.
CREATE TABLE IF NOT EXISTS building_external_ids (
    source_site TEXT NOT NULL,
    external_id TEXT NOT NULL,
    building_id INTEGER NOT NULL REFERENCES buildings(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL,
    PRIMARY KEY (source_site, external_id)
);

CREATE TABLE IF NOT EXISTS ambiguous_property_matches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    building_id INTEGER NOT NULL,
    listing_key TEXT NOT NULL,
    candidate_property_ids TEXT NOT NULL,
    selected_property_id INTEGER NOT NULL,
    confidence REAL NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_apm_building ON ambiguous_property_matches(building_id);

CREATE TABLE IF NOT EXISTS url_404_retries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_site TEXT NOT NULL,
    site_property_id TEXT NOT NULL,
    error_count INTEGER NOT NULL DEFAULT 1,
    first_error_at TEXT NOT NULL,
    last_error_at TEXT NOT NULL,
    retry_after TEXT NOT NULL,
    is_resolved INTEGER NOT NULL DEFAULT 0,
    UNIQUE(source_site, site_property_id)
);

CREATE TABLE IF NOT EXISTS price_mismatch_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_site TEXT NOT NULL,
    site_property_id TEXT NOT NULL,
    list_price INTEGER NOT NULL,
    detail_price INTEGER NOT NULL,
    error_count INTEGER NOT NULL DEFAULT 1,
    first_error_at TEXT NOT NULL,
    last_error_at TEXT NOT NULL,
    retry_after TEXT NOT NULL,
    is_resolved INTEGER NOT NULL DEFAULT 0,
    UNIQUE(source_site, site_property_id)
);

CREATE TABLE IF NOT EXISTS scrape_tasks (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    scrapers TEXT NOT NULL,
    area_codes TEXT NOT NULL,
    max_properties INTEGER NOT NULL,
    force_detail_fetch INTEGER NOT NULL DEFAULT 0,
    mode TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    pause_timestamp TEXT,
    total_processed INTEGER NOT NULL DEFAULT 0,
    total_new INTEGER NOT NULL DEFAULT 0,
    total_updated INTEGER NOT NULL DEFAULT 0,
    total_errors INTEGER NOT NULL DEFAULT 0,
    elapsed_seconds REAL NOT NULL DEFAULT 0,
    logs TEXT NOT NULL DEFAULT '[]',
    error_logs TEXT NOT NULL DEFAULT '[]',
    warning_logs TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS scrape_task_progress (
    task_id TEXT NOT NULL REFERENCES scrape_tasks(id) ON DELETE CASCADE,
    scraper TEXT NOT NULL,
    area TEXT NOT NULL,
    status TEXT NOT NULL,
    properties_found INTEGER NOT NULL DEFAULT 0,
    properties_attempted INTEGER NOT NULL DEFAULT 0,
    properties_processed INTEGER NOT NULL DEFAULT 0,
    detail_fetched INTEGER NOT NULL DEFAULT 0,
    detail_fetch_failed INTEGER NOT NULL DEFAULT 0,
    detail_skipped INTEGER NOT NULL DEFAULT 0,
    new_listings INTEGER NOT NULL DEFAULT 0,
    price_updated INTEGER NOT NULL DEFAULT 0,
    other_updates INTEGER NOT NULL DEFAULT 0,
    refetched_unchanged INTEGER NOT NULL DEFAULT 0,
    save_failed INTEGER NOT NULL DEFAULT 0,
    price_missing INTEGER NOT NULL DEFAULT 0,
    building_info_missing INTEGER NOT NULL DEFAULT 0,
    other_errors INTEGER NOT NULL DEFAULT 0,
    resume_state TEXT,
    last_updated TEXT NOT NULL,
    PRIMARY KEY (task_id, scraper, area)
);
"#;
