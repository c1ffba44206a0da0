use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use aviation_loader::config::{ImportConfig, ViewMode};
use aviation_loader::record::ParseError;
use aviation_loader::store::{Document, MemoryStore, SortDirection, ID_FIELD};
use aviation_loader::view::{ViewDefinition, ViewMaintainer};
use aviation_loader::{ImportError, Importer};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use tempfile::TempDir;

const HEADER: &str = "Event Id|Event Date|Location|Make|Model|Total Fatal Injuries";

const ROWS: [&str; 5] = [
    "20001218X45444|01/05/1994|ANCHORAGE, AK|PIPER|PA-18|2",
    "20001218X45447|01/20/1994|BOISE, ID|CESSNA|172|",
    "20001218X45448|02/01/1994|MIAMI, FL|CESSNA|152|1",
    "20001218X45449|12/31/1994|DENVER, CO|BOEING|737|0",
    "20001218X45450|03/15/1995|TULSA, OK|PIPER|PA-28|4",
];

fn write_input(dir: &Path, name: &str, rows: &[&str]) -> PathBuf {
    let path = dir.join(name);
    let mut text = format!("{HEADER}\n");
    for row in rows {
        text.push_str(row);
        text.push('\n');
    }
    if name.ends_with(".gz") {
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap();
    } else {
        std::fs::write(&path, text).unwrap();
    }
    path
}

fn shipped_views() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("views")
}

fn config(checkpoint: usize, views_dir: PathBuf) -> ImportConfig {
    ImportConfig {
        checkpoint,
        views_dir,
        ..ImportConfig::default()
    }
}

fn without_ids(documents: Vec<Document>) -> Vec<Document> {
    documents
        .into_iter()
        .map(|mut document| {
            document.remove(ID_FIELD);
            document
        })
        .collect()
}

#[tokio::test]
async fn imports_records_and_builds_views() {
    let dir = TempDir::new().unwrap();
    let input = write_input(dir.path(), "AviationData.txt", &ROWS);
    let store = MemoryStore::new();

    let report = Importer::new(&store, config(2, shipped_views()))
        .run(&input, "crashes")
        .await
        .unwrap();

    assert_eq!(report.stats.documents, 5);
    assert_eq!(report.stats.batches, 3);
    assert_eq!(store.bulk_insert_sizes(), vec![2, 2, 1]);
    assert_eq!(store.indexes("crashes"), vec![("Make".to_owned(), SortDirection::Descending)]);

    let names: Vec<&str> = report.views.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, vec!["event_date", "make"]);
    assert_eq!(report.views[0].records, 5);
    assert_eq!(report.views[0].keys, Some(4));

    let first = &store.documents("event_date")[0];
    assert_eq!(
        serde_json::Value::Object(first.clone()),
        json!({"_id": {"year": 1994, "month": 0}, "value": {"crashes": 2, "fatalities": 2}})
    );

    let documents = store.documents("crashes");
    assert_eq!(documents[0]["Event Date"], json!("1994-01-05"));
    let keys: Vec<&str> = documents[0].keys().map(String::as_str).collect();
    assert_eq!(
        keys,
        vec!["_id", "Event Id", "Event Date", "Location", "Make", "Model", "Total Fatal Injuries"]
    );
}

#[tokio::test]
async fn malformed_row_stops_the_import() {
    let dir = TempDir::new().unwrap();
    let rows = [ROWS[0], ROWS[1], "20001218X45451|04/01/1995|PIPER", ROWS[3]];
    let input = write_input(dir.path(), "AviationData.txt", &rows);
    let store = MemoryStore::new();

    let result = Importer::new(&store, config(1, dir.path().join("views")))
        .run(&input, "crashes")
        .await;

    match result {
        Err(ImportError::Record {
            line,
            source: ParseError::FieldCount { expected, found },
        }) => assert_eq!((line, expected, found), (4, 6, 3)),
        other => panic!("expected a field count error, got {other:?}"),
    }
    let ids: Vec<String> = store
        .documents("crashes")
        .iter()
        .map(|d| d["Event Id"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(ids, vec!["20001218X45444", "20001218X45447"]);
    assert!(store.indexes("crashes").is_empty());
}

#[tokio::test]
async fn bad_dates_abort_before_the_batch_is_written() {
    let dir = TempDir::new().unwrap();
    let rows = [ROWS[0], "20001218X45451|1995-04-01|TULSA, OK|PIPER|PA-28|0"];
    let input = write_input(dir.path(), "AviationData.txt", &rows);
    let store = MemoryStore::new();

    let result = Importer::new(&store, config(10, dir.path().join("views")))
        .run(&input, "crashes")
        .await;

    assert!(matches!(
        result,
        Err(ImportError::Record { line: 3, source: ParseError::Date(_) })
    ));
    assert_eq!(store.len("crashes"), 0);
}

#[tokio::test]
async fn gzipped_input_imports_like_plain_text() {
    let dir = TempDir::new().unwrap();
    let plain = write_input(dir.path(), "AviationData.txt", &ROWS);
    let gzipped = write_input(dir.path(), "AviationData.txt.gz", &ROWS);

    let plain_store = MemoryStore::new();
    Importer::new(&plain_store, config(1000, dir.path().join("views")))
        .run(&plain, "crashes")
        .await
        .unwrap();
    let gz_store = MemoryStore::new();
    Importer::new(&gz_store, config(1000, dir.path().join("views")))
        .run(&gzipped, "crashes")
        .await
        .unwrap();

    assert_eq!(
        without_ids(plain_store.documents("crashes")),
        without_ids(gz_store.documents("crashes"))
    );
    assert_eq!(plain_store.bulk_insert_sizes(), vec![5]);
}

#[tokio::test]
async fn incremental_import_matches_rebuild() {
    let dir = TempDir::new().unwrap();
    let input = write_input(dir.path(), "AviationData.txt", &ROWS);

    let incremental = MemoryStore::new();
    let report = Importer::new(
        &incremental,
        ImportConfig {
            view_mode: ViewMode::Incremental,
            ..config(2, shipped_views())
        },
    )
    .run(&input, "crashes")
    .await
    .unwrap();
    assert!(report.views.iter().all(|v| v.mode == ViewMode::Incremental && v.records == 5));
    assert_eq!(incremental.len("event_date.contributions"), 5);

    let rebuilt = MemoryStore::new();
    Importer::new(&rebuilt, config(2, shipped_views()))
        .run(&input, "crashes")
        .await
        .unwrap();

    for definition in [ViewDefinition::event_date(), ViewDefinition::make()] {
        let view = ViewMaintainer::new(definition, "crashes");
        assert_eq!(
            view.entries(&incremental).await.unwrap(),
            view.entries(&rebuilt).await.unwrap()
        );
    }
}

#[tokio::test]
async fn drop_replaces_previous_import() {
    let dir = TempDir::new().unwrap();
    let input = write_input(dir.path(), "AviationData.txt", &ROWS);
    let store = MemoryStore::new();

    for _ in 0..2 {
        Importer::new(&store, config(1000, shipped_views()))
            .with_drop(true)
            .run(&input, "crashes")
            .await
            .unwrap();
    }
    assert_eq!(store.len("crashes"), 5);

    Importer::new(&store, config(1000, shipped_views()))
        .run(&input, "crashes")
        .await
        .unwrap();
    assert_eq!(store.len("crashes"), 10);
}

#[tokio::test]
async fn rebuild_views_without_importing() {
    let dir = TempDir::new().unwrap();
    let input = write_input(dir.path(), "AviationData.txt", &ROWS);
    let store = MemoryStore::new();
    let importer = Importer::new(
        &store,
        ImportConfig {
            view_mode: ViewMode::Incremental,
            ..config(1000, dir.path().join("no-views"))
        },
    );
    importer.run(&input, "crashes").await.unwrap();
    assert_eq!(store.len("event_date"), 0);

    let importer = Importer::new(&store, config(1000, shipped_views()));
    let views = importer.rebuild_views("crashes").await.unwrap();
    assert_eq!(views.len(), 2);
    assert_eq!(store.len("event_date"), 4);
    assert_eq!(store.len("make"), 3);
}

#[tokio::test]
async fn empty_input_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("empty.txt");
    std::fs::write(&path, "").unwrap();
    let store = MemoryStore::new();

    let result = Importer::new(&store, ImportConfig::default())
        .run(&path, "crashes")
        .await;
    assert!(matches!(result, Err(ImportError::EmptyInput)));
    assert!(store.bulk_insert_sizes().is_empty());
}
