//! Portal listing page: where it comes from and how its table rows become raw
//! entries.

use std::path::PathBuf;

use async_trait::async_trait;
use regrec_core::{fields, Period, RawEntry, ReportFamily, ScalarValue};
use regrec_storage::{BasicAuth, PortalClient};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info};

use crate::AdapterError;

/// Cells per data row in the portal's result table.
const DATA_ROW_CELLS: usize = 8;
const ID_SEPARATOR: &str = "##";
const LIST_SIZE: &str = "5000";

#[async_trait]
pub trait ListingSource: Send + Sync {
    /// Human-readable origin for logs and reports.
    fn describe(&self) -> String;

    async fn fetch_listing(
        &self,
        family: &ReportFamily,
        period: &Period,
    ) -> Result<String, AdapterError>;
}

/// Live portal over HTTPS with basic auth.
pub struct HttpListingSource {
    client: PortalClient,
    url: String,
    auth: BasicAuth,
}

impl HttpListingSource {
    pub fn new(client: PortalClient, url: impl Into<String>, auth: BasicAuth) -> Self {
        Self {
            client,
            url: url.into(),
            auth,
        }
    }
}

/// Search form the portal expects for one subject area and period.
pub fn listing_form(family: &ReportFamily, period: &Period) -> Vec<(String, String)> {
    [
        ("value(nisfinder)", "true"),
        ("value(nismeldungkeys)", ""),
        ("auswahl(isachgebiet)", family.subject_area.as_str()),
        ("value(aelz)", ""),
        ("value(alieferung)", ""),
        ("value(ntest)", "cb.all"),
        ("value(nlieferungstatus)", "cb.all"),
        ("value(teingang_von)", ""),
        ("value(teingang_bis)", ""),
        ("value(nabholstatus)", "cb.all"),
        ("value(ntyp_identnr)", "1"),
        ("value(alz)", ""),
        ("auswahl(itermin)", period.as_str()),
        ("value(ntyp)", "cb.all"),
        ("value(nlistsize)", LIST_SIZE),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[async_trait]
impl ListingSource for HttpListingSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn fetch_listing(
        &self,
        family: &ReportFamily,
        period: &Period,
    ) -> Result<String, AdapterError> {
        let form = listing_form(family, period);
        let resp = self.client.post_form(&self.url, &form, Some(&self.auth)).await?;
        info!(
            family = family.name.as_str(),
            %period,
            bytes = resp.body.len(),
            "fetched portal listing"
        );
        Ok(decode_listing(&resp.body, resp.content_type.as_deref()))
    }
}

/// Saved listing page on disk.
pub struct FileListingSource {
    path: PathBuf,
}

impl FileListingSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ListingSource for FileListingSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch_listing(
        &self,
        _family: &ReportFamily,
        _period: &Period,
    ) -> Result<String, AdapterError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| AdapterError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(decode_listing(&bytes, None))
    }
}

fn charset_label(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"'))
    })
}

/// Decode a listing page. A declared charset is honoured; otherwise the page
/// is read as UTF-8 and, failing that, as Windows-1252 (a Latin-1 superset).
pub fn decode_listing(bytes: &[u8], content_type: Option<&str>) -> String {
    let declared = content_type
        .and_then(charset_label)
        .and_then(|label| encoding_rs::Encoding::for_label(label.as_bytes()));
    if let Some(encoding) = declared {
        let (text, _, _) = encoding.decode(bytes);
        return text.into_owned();
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => text.trim_start_matches('\u{feff}').to_string(),
        Err(_) => {
            debug!("listing is not UTF-8, decoding as windows-1252");
            let (text, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            text.into_owned()
        }
    }
}

fn cell_text(cell: &ElementRef<'_>) -> String {
    cell.text().collect::<String>().trim().to_string()
}

/// Portal renders `a.zip_b.xml` for nested files; the warehouse stores
/// `a.zip - b.xml`.
pub fn normalize_file_label(label: &str) -> String {
    label.replace(".zip_", ".zip - ")
}

/// Extract one raw entry per data row. Rows that do not have the expected
/// shape are skipped.
pub fn parse_listing_html(html: &str) -> Result<Vec<RawEntry>, AdapterError> {
    let document = Html::parse_document(html);
    let row_sel = selector("tr")?;
    let cell_sel = selector("td")?;
    let checkbox_sel = selector("input[type=\"checkbox\"]")?;

    let mut out = Vec::new();
    let mut skipped = 0usize;
    for row in document.select(&row_sel) {
        let cells = row.select(&cell_sel).collect::<Vec<_>>();
        if cells.len() != DATA_ROW_CELLS {
            continue;
        }
        let Some(value) = cells[0]
            .select(&checkbox_sel)
            .next()
            .and_then(|input| input.value().attr("value"))
        else {
            skipped += 1;
            continue;
        };
        let ids = value.split(ID_SEPARATOR).collect::<Vec<_>>();
        let [primary, secondary] = ids.as_slice() else {
            skipped += 1;
            continue;
        };

        let mut entry = RawEntry::new();
        let mut put = |name: &str, text: String| {
            entry.insert(name.to_string(), ScalarValue::Text(text));
        };
        put(fields::PRIMARY_ID, primary.trim().to_string());
        put(fields::SECONDARY_ID, secondary.trim().to_string());
        put(fields::REPORTER_ID, cell_text(&cells[1]));
        put(fields::INSTITUTION_TYPE, cell_text(&cells[2]));
        put(fields::PERIOD, cell_text(&cells[3]));
        put(fields::FILE_LABEL, normalize_file_label(&cell_text(&cells[4])));
        put(fields::CREATED_AT_SOURCE, cell_text(&cells[5]));
        put(fields::RECORD_TYPE, cell_text(&cells[6]));
        out.push(entry);
    }
    debug!(entries = out.len(), skipped, "parsed listing");
    Ok(out)
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}
