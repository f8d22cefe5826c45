use std::path::{Path, PathBuf};

use regrec_adapters::{
    parse_listing_html, FileListingSource, FixtureWarehouse, ListingSource, WarehouseSource,
};
use regrec_core::{Period, RecordKind, ReportFamily, ScalarValue};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn wpi() -> ReportFamily {
    ReportFamily {
        name: "wpi".into(),
        table_prefix: "BMI".into(),
        subject_area: "14".into(),
        accepted_key_column: "datei_id".into(),
        rejected_key_column: "import_datei_id".into(),
        extra_required_columns: vec![],
    }
}

#[tokio::test]
async fn saved_listing_parses_every_data_row() {
    let source = FileListingSource::new(workspace_root().join("fixtures/portal/listing_202501.html"));
    let html = source
        .fetch_listing(&wpi(), &Period::parse("202501").unwrap())
        .await
        .unwrap();
    let entries = parse_listing_html(&html).unwrap();

    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0]["secondary_id"], ScalarValue::text("A1"));
    assert_eq!(entries[0]["primary_id"], ScalarValue::text("100231"));
    assert_eq!(
        entries[1]["file_label"],
        ScalarValue::text("bundle.zip - wpi_81.xml")
    );
    assert_eq!(entries[2]["institution_type"], ScalarValue::text("KVG"));
}

#[tokio::test]
async fn latin1_listing_is_decoded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("latin1.html");
    let mut page = b"<html><head><meta charset=\"iso-8859-1\"></head><body><table><tr>\
<td><input type=\"checkbox\" value=\"P1##A1\"></td><td>77</td><td>KI</td>\
<td>202501</td><td>x.zip</td><td>2025-01-15 10:00</td><td>WPI</td><td>Gr"
        .to_vec();
    page.push(0xfc);
    page.extend_from_slice(b"n</td></tr></table></body></html>");
    std::fs::write(&path, page).unwrap();

    let html = FileListingSource::new(&path)
        .fetch_listing(&wpi(), &Period::parse("202501").unwrap())
        .await
        .unwrap();
    assert!(html.contains("Grün"));
    let entries = parse_listing_html(&html).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["secondary_id"], ScalarValue::text("A1"));
}

#[tokio::test]
async fn warehouse_fixtures_load_for_both_kinds() {
    let warehouse = FixtureWarehouse::new(workspace_root().join("fixtures/warehouse"));
    let accepted = warehouse.load_rows(&wpi(), RecordKind::Accepted).await.unwrap();
    let rejected = warehouse.load_rows(&wpi(), RecordKind::Rejected).await.unwrap();

    assert_eq!(accepted[0]["anzahl_saetze"], ScalarValue::Integer(1412));
    assert_eq!(rejected.len(), 2);
    assert!(!rejected[1].contains_key("import_datei_id"));
}
