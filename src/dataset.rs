//! Dataset access and windowing
//!
//! Rows come from the English subset of `ai4privacy/pii-masking-300k`. They are
//! pulled page by page from the Hugging Face datasets-server, stripped of the
//! few-shot demonstration rows, and cached under `data/` so repeated runs skip
//! the download.
//!
//! Windowing is plain index arithmetic over the filtered rows: train and
//! validation come from the front, evaluation starts where they end (or is
//! sampled from everything past a boundary).

use crate::fewshot;
use crate::labels::PiiEntity;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use tracing::{debug, info, warn};

pub const DATASET_NAME: &str = "ai4privacy/pii-masking-300k";
pub const DATASET_CACHE_PATH: &str = "data/ai4privacy/english.json";
const DATASETS_SERVER_FILTER_URL: &str = "https://datasets-server.huggingface.co/filter";
const PAGE_SIZE: usize = 100;
const CACHE_VERSION: u32 = 1;

/// One row of the source dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRow {
    pub id: String,
    pub source_text: String,
    pub target_text: String,
    #[serde(default)]
    pub language: String,
}

/// Model input plus the gold (or predicted) redaction.
///
/// `entities` is only populated for curated gold examples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<PiiEntity>,
    pub redacted_text: String,
}

impl Example {
    pub fn new(text: impl Into<String>, redacted_text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            entities: Vec::new(),
            redacted_text: redacted_text.into(),
        }
    }
}

impl From<&DatasetRow> for Example {
    fn from(row: &DatasetRow) -> Self {
        Example::new(row.source_text.clone(), row.target_text.clone())
    }
}

/// What a window of rows is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPurpose {
    Train,
    Validation,
    Evaluation,
}

/// A set of row indices tagged with its purpose. Indices are ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetWindow {
    pub purpose: WindowPurpose,
    pub indices: Vec<usize>,
}

impl DatasetWindow {
    pub fn contiguous(purpose: WindowPurpose, start: usize, end: usize) -> Self {
        Self {
            purpose,
            indices: (start..end.max(start)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn overlaps(&self, other: &DatasetWindow) -> bool {
        let mine: HashSet<usize> = self.indices.iter().copied().collect();
        other.indices.iter().any(|i| mine.contains(i))
    }

    /// Build examples for the window. Indices past the end are skipped.
    pub fn examples(&self, rows: &[DatasetRow]) -> Vec<IndexedExample> {
        self.indices
            .iter()
            .filter_map(|&index| {
                rows.get(index).map(|row| IndexedExample {
                    index,
                    row_id: row.id.clone(),
                    example: Example::from(row),
                })
            })
            .collect()
    }
}

/// An example with the row position and id it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedExample {
    pub index: usize,
    pub row_id: String,
    pub example: Example,
}

/// Split the front of `rows` into train and validation.
///
/// Takes `train_size + val_size` rows, capped at what is available.
pub fn train_val_split<T>(rows: &[T], train_size: usize, val_size: usize) -> (&[T], &[T]) {
    let end = train_size.saturating_add(val_size).min(rows.len());
    let split = train_size.min(end);
    (&rows[..split], &rows[split..end])
}

/// Index windows matching [`train_val_split`].
pub fn train_val_windows(
    total: usize,
    train_size: usize,
    val_size: usize,
) -> (DatasetWindow, DatasetWindow) {
    let end = train_size.saturating_add(val_size).min(total);
    let split = train_size.min(end);
    (
        DatasetWindow::contiguous(WindowPurpose::Train, 0, split),
        DatasetWindow::contiguous(WindowPurpose::Validation, split, end),
    )
}

/// `rows[offset..offset + size]`, clamped. An offset past the end yields an
/// empty slice.
pub fn eval_slice<T>(rows: &[T], size: usize, offset: usize) -> &[T] {
    if offset >= rows.len() {
        return &[];
    }
    let end = offset.saturating_add(size).min(rows.len());
    &rows[offset..end]
}

/// Index window matching [`eval_slice`].
pub fn eval_window(total: usize, size: usize, offset: usize) -> DatasetWindow {
    if offset >= total {
        return DatasetWindow::contiguous(WindowPurpose::Evaluation, 0, 0);
    }
    let end = offset.saturating_add(size).min(total);
    DatasetWindow::contiguous(WindowPurpose::Evaluation, offset, end)
}

/// What to do when the random pool holds fewer rows than requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShortfallPolicy {
    /// Sample the whole pool and log a warning.
    #[default]
    Cap,
    /// Refuse to sample.
    Reject,
}

/// Sample `min(size, total - exclude_count)` distinct indices from
/// `[exclude_count, total)`, returned ascending.
pub fn eval_indices_randomized(
    total: usize,
    size: usize,
    exclude_count: usize,
    seed: Option<u64>,
    policy: ShortfallPolicy,
) -> Result<Vec<usize>> {
    let pool = total.saturating_sub(exclude_count);
    if size > pool {
        match policy {
            ShortfallPolicy::Cap => warn!(
                requested = size,
                available = pool,
                "Random evaluation pool is smaller than requested; sampling the whole pool"
            ),
            ShortfallPolicy::Reject => {
                return Err(anyhow!(
                    "Requested {} evaluation rows but only {} are available past row {}",
                    size,
                    pool,
                    exclude_count
                ))
            }
        }
    }
    let amount = size.min(pool);

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut indices: Vec<usize> = rand::seq::index::sample(&mut rng, pool, amount)
        .into_iter()
        .map(|i| i + exclude_count)
        .collect();
    indices.sort_unstable();
    Ok(indices)
}

/// Randomized evaluation window, see [`eval_indices_randomized`].
pub fn eval_window_randomized(
    total: usize,
    size: usize,
    exclude_count: usize,
    seed: Option<u64>,
    policy: ShortfallPolicy,
) -> Result<DatasetWindow> {
    Ok(DatasetWindow {
        purpose: WindowPurpose::Evaluation,
        indices: eval_indices_randomized(total, size, exclude_count, seed, policy)?,
    })
}

/// Drop rows whose id is in `excluded_ids`, keeping order.
pub fn exclude_rows<I>(rows: I, excluded_ids: &HashSet<String>) -> Vec<DatasetRow>
where
    I: IntoIterator<Item = DatasetRow>,
{
    rows.into_iter()
        .filter(|row| !excluded_ids.contains(&row.id))
        .collect()
}

/// One page of upstream rows.
#[derive(Debug, Clone)]
pub struct RowPage {
    pub rows: Vec<DatasetRow>,
    pub total: usize,
}

/// Anything that can serve the upstream row collection in pages.
pub trait RowSource {
    fn fetch_page(
        &self,
        offset: usize,
        length: usize,
    ) -> impl std::future::Future<Output = Result<RowPage>> + Send;
}

/// Datasets-server client for the English rows of the source dataset.
pub struct HubRowSource {
    client: reqwest::Client,
    dataset: String,
    split: String,
}

impl Default for HubRowSource {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
            dataset: DATASET_NAME.to_string(),
            split: "train".to_string(),
        }
    }
}

#[derive(Deserialize)]
struct FilterResponse {
    rows: Vec<FilterRow>,
    #[serde(default)]
    num_rows_total: usize,
}

#[derive(Deserialize)]
struct FilterRow {
    row: DatasetRow,
}

impl HubRowSource {
    fn page_url(&self, offset: usize, length: usize) -> Result<url::Url> {
        url::Url::parse_with_params(
            DATASETS_SERVER_FILTER_URL,
            &[
                ("dataset", self.dataset.as_str()),
                ("config", "default"),
                ("split", self.split.as_str()),
                ("where", "\"language\"='English'"),
                ("offset", offset.to_string().as_str()),
                ("length", length.to_string().as_str()),
            ],
        )
        .map_err(|e| anyhow!("Failed to build datasets-server URL: {}", e))
    }
}

impl RowSource for HubRowSource {
    async fn fetch_page(&self, offset: usize, length: usize) -> Result<RowPage> {
        let url = self.page_url(offset, length)?;
        debug!(%url, "Fetching dataset page");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to download {} rows at offset {}", self.dataset, offset))?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "Dataset download failed ({}): {}",
                status,
                crate::util::truncate(&text, 200)
            ));
        }
        let parsed: FilterResponse = serde_json::from_str(&text)
            .with_context(|| format!("Unexpected datasets-server response at offset {}", offset))?;
        Ok(RowPage {
            rows: parsed.rows.into_iter().map(|r| r.row).collect(),
            total: parsed.num_rows_total,
        })
    }
}

/// On-disk copy of the filtered rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedDataset {
    pub version: u32,
    pub dataset: String,
    /// Upstream rows consumed so far, before few-shot filtering.
    pub upstream_offset: usize,
    pub exhausted: bool,
    pub fetched_at: DateTime<Utc>,
    pub rows: Vec<DatasetRow>,
}

impl CachedDataset {
    fn empty() -> Self {
        Self {
            version: CACHE_VERSION,
            dataset: DATASET_NAME.to_string(),
            upstream_offset: 0,
            exhausted: false,
            fetched_at: Utc::now(),
            rows: Vec::new(),
        }
    }
}

/// Filtered dataset cache at a fixed path.
pub struct DatasetCache {
    path: PathBuf,
}

struct CacheLock {
    file: std::fs::File,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl Default for DatasetCache {
    fn default() -> Self {
        Self::new(DATASET_CACHE_PATH)
    }
}

impl DatasetCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn lock(&self) -> Result<CacheLock> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create dataset directory '{}'", parent.display())
            })?;
        }
        let lock_path = self.path.with_extension("lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        file.lock_exclusive()?;
        Ok(CacheLock { file })
    }

    /// Read the cache. A missing, unreadable or outdated file is a miss.
    pub fn load(&self) -> Option<CachedDataset> {
        let content = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<CachedDataset>(&content) {
            Ok(cached) if cached.version == CACHE_VERSION => Some(cached),
            Ok(_) => {
                debug!(path = %self.path.display(), "Ignoring dataset cache from an older version");
                None
            }
            Err(err) => {
                warn!(path = %self.path.display(), "Dataset cache is corrupt ({}); it will be rebuilt", err);
                None
            }
        }
    }

    pub fn save(&self, cached: &CachedDataset) -> Result<()> {
        let _lock = self.lock()?;
        self.store(cached)
    }

    /// Write without locking; callers hold the cache lock.
    fn store(&self, cached: &CachedDataset) -> Result<()> {
        let content = serde_json::to_string(cached)?;
        crate::util::write_atomic(&self.path, &content)
            .with_context(|| format!("Failed to write dataset cache '{}'", self.path.display()))
    }

    /// Return at least `min_rows` filtered rows when upstream has them.
    ///
    /// Cached rows are reused; only the missing tail is downloaded.
    pub async fn ensure_rows<S: RowSource>(
        &self,
        source: &S,
        min_rows: usize,
    ) -> Result<Vec<DatasetRow>> {
        // held across load, download and write so concurrent runs don't race
        let _lock = self.lock()?;
        let mut cached = self.load().unwrap_or_else(CachedDataset::empty);
        if cached.rows.len() >= min_rows || cached.exhausted {
            info!(
                rows = cached.rows.len(),
                path = %self.path.display(),
                "Using cached dataset"
            );
            return Ok(cached.rows);
        }

        info!(
            have = cached.rows.len(),
            want = min_rows,
            "Downloading {} (English rows)",
            DATASET_NAME
        );
        let excluded = fewshot::excluded_row_ids();
        while cached.rows.len() < min_rows && !cached.exhausted {
            let page = source.fetch_page(cached.upstream_offset, PAGE_SIZE).await?;
            let fetched = page.rows.len();
            cached.upstream_offset += fetched;
            cached.rows.extend(exclude_rows(page.rows, excluded));
            if fetched < PAGE_SIZE || (page.total > 0 && cached.upstream_offset >= page.total) {
                cached.exhausted = true;
            }
        }
        cached.fetched_at = Utc::now();
        self.store(&cached)?;
        info!(
            rows = cached.rows.len(),
            exhausted = cached.exhausted,
            "Dataset cache updated"
        );
        Ok(cached.rows)
    }
}
