//! Full pipeline runs against small synthetic installations.

use std::fs;
use std::path::PathBuf;

use jfmigrate_core::config::normalize_separators;
use jfmigrate_core::timestamps::format_server_time;
use jfmigrate_core::{
    derive_item_id, CancellationToken, ColumnKind, DerivationContext, IdKind, IdentifierMap, ItemId,
    Ledger, MigrateError, MigrationConfig, Migrator, Outcome, PathRewriter, RowStore, TableSpec,
};
use rusqlite::{params, Connection};
use serde_json::{json, Value};
use tempfile::TempDir;

const PROGRAM_DATA: &str = r"C:\ProgramData\Jellyfin\Server";
const MOVIE_TYPE: &str = "MediaBrowser.Controller.Entities.Movies.Movie";
const MOVIE_PATH: &str = r"D:\Movies\Alien (1979)\Alien.mkv";
const PERSON_TYPE: &str = "MediaBrowser.Controller.Entities.Person";
const PERSON_PATH: &str = r"C:\ProgramData\Jellyfin\Server\metadata\People\A\Actor\poster.jpg";
const UNRELATED_ID: &str = "11111111-2222-3333-4444-555555555555";

const NETWORKING_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<NetworkConfiguration>
  <CertificatePath>C:\ProgramData\Jellyfin\Server\config\ssl\cert.pfx</CertificatePath>
  <BaseUrl />
</NetworkConfiguration>
"#;

struct Fixture {
    _tmp: TempDir,
    source: PathBuf,
    target: PathBuf,
    state: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("source");
        let target = tmp.path().join("target");
        let state = tmp.path().join("state");
        fs::create_dir_all(&source).unwrap();
        Self {
            _tmp: tmp,
            source,
            target,
            state,
        }
    }

    fn write(&self, relative: &str, contents: &[u8]) -> PathBuf {
        let path = self.source.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    fn config(&self, jobs: Value, extra: Value) -> MigrationConfig {
        let mut doc = json!({
            "path_rules": {
                "slash": "/",
                "rules": [
                    {"from": "C:/ProgramData/Jellyfin/Server/config", "to": "/config"},
                    {"from": "C:/ProgramData/Jellyfin/Server", "to": "/data"},
                    {"from": "D:/Movies", "to": "/media/movies"}
                ]
            },
            "roots": {
                "original": "C:/ProgramData/Jellyfin/Server",
                "source": self.source,
                "target": self.target
            },
            "state_dir": self.state,
            "id_derivation": {"old_program_data_path": PROGRAM_DATA},
            "jobs": jobs
        });
        if let (Some(doc), Some(extra)) = (doc.as_object_mut(), extra.as_object()) {
            for (key, value) in extra {
                doc.insert(key.clone(), value.clone());
            }
        }
        MigrationConfig::from_json_str(&doc.to_string()).unwrap()
    }
}

fn old_ctx() -> DerivationContext<'static> {
    DerivationContext {
        program_data_path: Some(PROGRAM_DATA),
        case_sensitive: false,
    }
}

fn movie_ids(config: &MigrationConfig) -> (ItemId, ItemId) {
    let old = derive_item_id(MOVIE_TYPE, MOVIE_PATH, old_ctx());
    let new_path = PathRewriter::new(&config.path_rules).rewrite_path(MOVIE_PATH).into_owned();
    let new_program_data = config.new_program_data_path();
    let new = derive_item_id(
        MOVIE_TYPE,
        &new_path,
        DerivationContext {
            program_data_path: new_program_data.as_deref(),
            case_sensitive: false,
        },
    );
    (old, new)
}

/// A library store with one movie referenced in three encodings, plus one
/// program-data item whose identifier survives the move.
fn write_library(fx: &Fixture) {
    let path = fx.source.join("data/library.db");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE TypedBaseItems (guid BLOB, type TEXT, path TEXT, DateCreated TEXT, DateModified TEXT);
         CREATE TABLE Chapters2 (ItemId TEXT, ChapterIndex INTEGER, Name TEXT);
         CREATE TABLE ItemLinks (ParentKey TEXT);",
    )
    .unwrap();

    let movie = derive_item_id(MOVIE_TYPE, MOVIE_PATH, old_ctx());
    let person = derive_item_id(PERSON_TYPE, PERSON_PATH, old_ctx());
    for (id, item_type, item_path) in [(movie, MOVIE_TYPE, MOVIE_PATH), (person, PERSON_TYPE, PERSON_PATH)] {
        conn.execute(
            "INSERT INTO TypedBaseItems VALUES (?1, ?2, ?3, '2020-01-01 00:00:00Z', '2020-01-01 00:00:00Z')",
            params![id.to_bin().to_vec(), item_type, item_path],
        )
        .unwrap();
    }
    conn.execute(
        "INSERT INTO Chapters2 VALUES (?1, 0, 'Opening')",
        params![movie.encode_text(IdKind::StrDash)],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO ItemLinks VALUES (?1)",
        params![format!("{};{}", movie.encode_text(IdKind::AncestorStrDash), UNRELATED_ID)],
    )
    .unwrap();
}

fn full_jobs() -> Value {
    json!({
        "paths": [
            {"source": "data/library.db", "target": "auto",
             "tables": {"TypedBaseItems": {"path_columns": ["path"]}}},
            {"source": "config/*.xml", "target": "auto"},
            {"source": "**/*", "target": "auto", "copy_only": true, "no_log": true}
        ],
        "id_paths": [
            {"source": "metadata/library/**/*", "target": "auto-existing"}
        ],
        "ids": [
            {"source": "data/library.db", "target": "auto-existing",
             "tables": {
                "TypedBaseItems": {"bin": ["guid"]},
                "Chapters2": {"str-dash": ["ItemId"]},
                "ItemLinks": {"ancestor-str-dash": ["ParentKey"]}
             }}
        ]
    })
}

fn full_fixture() -> (Fixture, MigrationConfig) {
    let fx = Fixture::new();
    write_library(&fx);
    fx.write("config/networking.xml", NETWORKING_XML.as_bytes());
    fx.write("metadata/People/A/Actor/poster.jpg", b"\xFF\xD8person");
    fx.write("plugins/readme.bin", b"\x00\x01\x02");

    let movie = derive_item_id(MOVIE_TYPE, MOVIE_PATH, old_ctx());
    let dir = movie.encode_text(IdKind::AncestorStr);
    fx.write(&format!("metadata/library/{}/{}/poster.jpg", &dir[..2], dir), b"\xFF\xD8movie");

    let config = fx.config(full_jobs(), json!({}));
    (fx, config)
}

#[test]
fn test_networking_xml_lands_under_container_config() {
    let (fx, config) = full_fixture();
    let summary = Migrator::new(&config, CancellationToken::new()).run().unwrap();
    assert!(summary.is_success(), "{summary}");

    let migrated = fx.target.join("config/networking.xml");
    let text = fs::read_to_string(&migrated).unwrap();
    assert!(text.contains("<CertificatePath>/config/ssl/cert.pfx</CertificatePath>"));
    assert!(!text.contains("ProgramData"));
    assert!(text.contains("<BaseUrl />"));

    // Swept up by the catch-all job, byte for byte.
    assert_eq!(
        fs::read(fx.target.join("data/plugins/readme.bin")).unwrap(),
        b"\x00\x01\x02"
    );
}

#[test]
fn test_one_item_in_three_encodings_maps_to_one_new_id() {
    let (fx, config) = full_fixture();
    let (old, new) = movie_ids(&config);
    assert_ne!(old, new);

    let summary = Migrator::new(&config, CancellationToken::new()).run().unwrap();
    assert!(summary.is_success(), "{summary}");
    assert_eq!(summary.items_remapped, 1);

    let db = fx.target.join("data/data/library.db");
    let conn = Connection::open(&db).unwrap();

    let guid: Vec<u8> = conn
        .query_row("SELECT guid FROM TypedBaseItems WHERE type = ?1", [MOVIE_TYPE], |r| r.get(0))
        .unwrap();
    assert_eq!(guid, new.to_bin().to_vec());

    let chapter: String = conn.query_row("SELECT ItemId FROM Chapters2", [], |r| r.get(0)).unwrap();
    assert_eq!(chapter, new.encode_text(IdKind::StrDash));

    let links: String = conn.query_row("SELECT ParentKey FROM ItemLinks", [], |r| r.get(0)).unwrap();
    assert_eq!(links, format!("{};{}", new.encode_text(IdKind::AncestorStrDash), UNRELATED_ID));

    // Paths were rewritten in phase 1.
    let movie_path: String = conn
        .query_row("SELECT path FROM TypedBaseItems WHERE type = ?1", [MOVIE_TYPE], |r| r.get(0))
        .unwrap();
    assert_eq!(movie_path, "/media/movies/Alien (1979)/Alien.mkv");
}

#[test]
fn test_no_stale_identifiers_after_propagation() {
    let (fx, config) = full_fixture();
    let summary = Migrator::new(&config, CancellationToken::new()).run().unwrap();
    assert!(summary.is_success(), "{summary}");

    let map = IdentifierMap::load(&fx.state.join("id_map.json")).unwrap().unwrap();
    assert_eq!(map.len(), 1);

    let tables = [
        ("TypedBaseItems", TableSpec::new([("guid", ColumnKind::BinId)])),
        ("Chapters2", TableSpec::new([("ItemId", ColumnKind::StrDashId)])),
        ("ItemLinks", TableSpec::new([("ParentKey", ColumnKind::AncestorStrDashId)])),
    ]
    .into_iter()
    .map(|(name, spec)| (name.to_string(), spec))
    .collect();

    let store = RowStore::open_read_only(&fx.target.join("data/data/library.db")).unwrap();
    assert_eq!(store.count_stale_ids(&tables, &map).unwrap(), 0);
}

#[test]
fn test_identifier_directories_are_renamed() {
    let (fx, config) = full_fixture();
    let (old, new) = movie_ids(&config);
    let summary = Migrator::new(&config, CancellationToken::new()).run().unwrap();
    assert!(summary.is_success(), "{summary}");

    let old_dir = old.encode_text(IdKind::AncestorStr);
    let new_dir = new.encode_text(IdKind::AncestorStr);
    let library = fx.target.join("data/metadata/library");

    let moved = library.join(&new_dir[..2]).join(&new_dir).join("poster.jpg");
    assert_eq!(fs::read(&moved).unwrap(), b"\xFF\xD8movie");
    assert!(!library.join(&old_dir[..2]).join(&old_dir).exists());

    let ledger = Ledger::open(&fx.state.join("ledger.jsonl")).unwrap();
    let entry = ledger
        .entries()
        .iter()
        .find(|e| e.phase == jfmigrate_core::Phase::IdPathMigration)
        .unwrap();
    assert_eq!(entry.target, moved);
    assert!(entry.server_path.contains(&new_dir));
}

#[test]
fn test_timestamps_match_migrated_files() {
    let (fx, config) = full_fixture();
    let summary = Migrator::new(&config, CancellationToken::new()).run().unwrap();
    assert!(summary.is_success(), "{summary}");

    let poster = fx.target.join("data/metadata/People/A/Actor/poster.jpg");
    let meta = fs::metadata(&poster).unwrap();
    let modified = meta.modified().unwrap();
    let created = meta.created().unwrap_or(modified);

    let conn = Connection::open(fx.target.join("data/data/library.db")).unwrap();
    let (stored_created, stored_modified): (String, String) = conn
        .query_row(
            "SELECT DateCreated, DateModified FROM TypedBaseItems WHERE type = ?1",
            [PERSON_TYPE],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(stored_created, format_server_time(created.into()));
    assert_eq!(stored_modified, format_server_time(modified.into()));

    // The movie file lives outside the migrated tree; left as stored.
    let movie_modified: String = conn
        .query_row("SELECT DateModified FROM TypedBaseItems WHERE type = ?1", [MOVIE_TYPE], |r| r.get(0))
        .unwrap();
    assert_eq!(movie_modified, "2020-01-01 00:00:00Z");
}

#[test]
fn test_rerun_is_idempotent() {
    let (_fx, config) = full_fixture();
    let first = Migrator::new(&config, CancellationToken::new()).run().unwrap();
    assert!(first.files_copied >= 5);

    let second = Migrator::new(&config, CancellationToken::new()).run().unwrap();
    assert!(second.is_success(), "{second}");
    assert_eq!(second.files_copied, 0);
    assert_eq!(second.ids_remapped, 0);
}

#[test]
fn test_unreadable_store_fails_only_its_job() {
    let fx = Fixture::new();
    fx.write("data/broken.db", b"this is not a database at all");
    fx.write("config/networking.xml", NETWORKING_XML.as_bytes());

    let jobs = json!({
        "paths": [
            {"source": "data/broken.db", "target": "auto",
             "tables": {"TypedBaseItems": {"path_columns": ["path"]}}},
            {"source": "config/networking.xml", "target": "auto"},
            {"source": "**/*", "target": "auto", "copy_only": true}
        ]
    });
    let config = fx.config(jobs, json!({"timestamps": {"enabled": false}}));

    let summary = Migrator::new(&config, CancellationToken::new()).run().unwrap();
    assert_eq!(summary.fatal_failures, 1);
    assert!(!summary.is_success());

    // No partial copy left behind, and the catch-all did not pick it up.
    assert!(!fx.target.join("data/data/broken.db").exists());
    assert!(fx.target.join("config/networking.xml").is_file());

    let ledger = Ledger::open(&fx.state.join("ledger.jsonl")).unwrap();
    let failed: Vec<_> = ledger
        .entries()
        .iter()
        .filter(|e| e.outcome == Outcome::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].source.ends_with("data/broken.db"));
}

#[test]
fn test_propagation_without_remapped_items_is_rejected_before_any_write() {
    let fx = Fixture::new();
    // The only item already lives where the rules would put it.
    let path = fx.source.join("data/library.db");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("CREATE TABLE TypedBaseItems (guid BLOB, type TEXT, path TEXT);")
        .unwrap();
    let id = derive_item_id(MOVIE_TYPE, "/srv/movies/a.mkv", old_ctx());
    conn.execute(
        "INSERT INTO TypedBaseItems VALUES (?1, ?2, '/srv/movies/a.mkv')",
        params![id.to_bin().to_vec(), MOVIE_TYPE],
    )
    .unwrap();
    drop(conn);

    let jobs = json!({
        "paths": [{"source": "**/*", "target": "auto"}],
        "ids": [{"source": "data/library.db", "target": "auto-existing",
                 "tables": {"TypedBaseItems": {"bin": ["guid"]}}}]
    });
    let config = fx.config(jobs, json!({}));

    let err = Migrator::new(&config, CancellationToken::new()).run().unwrap_err();
    assert!(matches!(err, MigrateError::Config { .. }));
    assert!(!fx.target.exists());
    assert!(!fx.state.exists());
}

#[test]
fn test_cancelled_run_stops_before_copying() {
    let (fx, config) = full_fixture();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = Migrator::new(&config, cancel).run().unwrap();
    assert!(summary.cancelled);
    assert!(!summary.is_success());
    assert_eq!(summary.files_copied, 0);
    assert!(!fx.target.exists());
}

#[test]
fn test_in_place_target_is_protected() {
    let fx = Fixture::new();
    let source = fx.write("config/system.xml", b"<Path>C:/ProgramData/Jellyfin/Server/config/x</Path>");
    let explicit = normalize_separators(&source.to_string_lossy());
    let jobs = json!({"paths": [{"source": "config/system.xml", "target": explicit}]});
    let config = fx.config(jobs, json!({"timestamps": {"enabled": false}}));

    let summary = Migrator::new(&config, CancellationToken::new()).run().unwrap();
    assert_eq!(summary.files_copied, 0);
    assert_eq!(summary.warnings, 1);
    assert!(fs::read_to_string(&source).unwrap().contains("C:/ProgramData"));
}

#[cfg(unix)]
#[test]
fn test_file_outside_every_rule_stays_below_target_root() {
    let fx = Fixture::new();
    fx.write("other/x.bin", b"payload");
    let jobs = json!({"paths": [{"source": "**/*", "target": "auto", "copy_only": true}]});
    let extra = json!({
        "path_rules": {"rules": [{"from": "C:/ProgramData/Jellyfin/Server/config", "to": "/config"}]},
        "timestamps": {"enabled": false}
    });
    let config = fx.config(jobs, extra);

    let summary = Migrator::new(&config, CancellationToken::new()).run().unwrap();
    assert_eq!(summary.files_copied, 1);
    assert_eq!(summary.warnings, 1);
    assert!(fx
        .target
        .join("C:/ProgramData/Jellyfin/Server/other/x.bin")
        .is_file());
}
