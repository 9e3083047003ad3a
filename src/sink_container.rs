//! Random-access safetensors container
//!
//! Word occurrences are stored as float32 tensors under
//! `tokens/<word>/<occurrence>` with shape `(layers, d_model)`, or one
//! `(d_model,)` tensor per layer under `tokens/<word>/<occurrence>/<layer>`
//! when layers are decomposed. The source sentence of each occurrence is kept
//! in the header's `__metadata__` map under the occurrence key.
//!
//! The safetensors header precedes the data and is only known at the end of
//! the run, so tensor bytes are spooled to a temporary file next to the
//! output while only keys, shapes and offsets stay in memory. Finishing the
//! sink writes the header and then copies the spooled data after it.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufWriter, IntoInnerError, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use safetensors::tensor::{SafeTensors, TensorView};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::extraction::SentenceRepresentation;
use crate::sink::{RepresentationSink, SinkOptions};

const KEY_ROOT: &str = "tokens";

/// Replace characters that would break the `tokens/<word>/<idx>` key layout
pub fn sanitize_key(word: &str) -> String {
    if word == "." {
        return "__DOT__".to_string();
    }
    word.replace('/', "__SLASH__")
}

/// Key of one word occurrence
pub fn occurrence_key(word: &str, occurrence: usize) -> String {
    format!("{KEY_ROOT}/{}/{occurrence}", sanitize_key(word))
}

/// Location of one tensor inside the spooled data
struct Entry {
    key: String,
    shape: Vec<usize>,
    begin: usize,
    end: usize,
}

/// safetensors header length alignment
const HEADER_ALIGNMENT: usize = 8;

/// Spools word occurrences to disk and writes them as one safetensors file
pub struct ContainerSink {
    path: PathBuf,
    spool: BufWriter<NamedTempFile>,
    /// Bytes spooled so far
    offset: usize,
    entries: Vec<Entry>,
    metadata: HashMap<String, String>,
    occurrences: HashMap<String, usize>,
    limit: Option<usize>,
    decompose_layers: bool,
    skipped: usize,
}

impl ContainerSink {
    pub fn create(path: &Path, options: SinkOptions) -> Result<Self> {
        let parent = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => {
                anyhow::ensure!(
                    parent.is_dir(),
                    "Output directory does not exist: {}",
                    parent.display()
                );
                parent
            }
            None => Path::new("."),
        };
        let spool = NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create spool file in {}", parent.display()))?;
        debug!("Spooling container data to {}", spool.path().display());

        Ok(Self {
            path: path.to_path_buf(),
            spool: BufWriter::new(spool),
            offset: 0,
            entries: Vec::new(),
            metadata: options.run_metadata.into_iter().collect(),
            occurrences: HashMap::new(),
            limit: options.limit_max_occurrences,
            decompose_layers: options.decompose_layers,
            skipped: 0,
        })
    }

    /// Append one float32 tensor to the spool
    fn append(&mut self, key: String, shape: Vec<usize>, values: &[f32]) -> Result<()> {
        for value in values {
            self.spool.write_all(&value.to_le_bytes())?;
        }
        let begin = self.offset;
        self.offset += values.len() * std::mem::size_of::<f32>();
        self.entries.push(Entry {
            key,
            shape,
            begin,
            end: self.offset,
        });
        Ok(())
    }

    /// JSON header padded with spaces to the safetensors alignment
    fn header(&self) -> Result<Vec<u8>> {
        let mut header = serde_json::Map::new();
        header.insert(
            "__metadata__".to_string(),
            serde_json::to_value(&self.metadata)?,
        );
        for entry in &self.entries {
            header.insert(
                entry.key.clone(),
                serde_json::json!({
                    "dtype": "F32",
                    "shape": entry.shape,
                    "data_offsets": [entry.begin, entry.end],
                }),
            );
        }
        let mut bytes = serde_json::to_vec(&header)?;
        bytes.resize(bytes.len().next_multiple_of(HEADER_ALIGNMENT), b' ');
        Ok(bytes)
    }
}

impl RepresentationSink for ContainerSink {
    fn write_sentence(&mut self, sentence: &SentenceRepresentation) -> Result<()> {
        for word in &sentence.words {
            let name = sanitize_key(&word.token);
            let occurrence = self.occurrences.get(&name).copied().unwrap_or(0);
            let key = format!("{KEY_ROOT}/{name}/{occurrence}");

            if self.limit.is_some_and(|limit| occurrence >= limit) {
                debug!("Skipping {} because of occurrence limit", key);
                self.skipped += 1;
                continue;
            }
            debug!("Container path: {}", key);

            let n_layers = word.layers.len();
            let d_model = word.layers.first().map_or(0, Vec::len);
            anyhow::ensure!(
                word.layers.iter().all(|l| l.len() == d_model),
                "Ragged layer vectors for {key}"
            );

            if self.decompose_layers {
                for (layer, values) in word.layers.iter().enumerate() {
                    self.append(format!("{key}/{layer}"), vec![d_model], values)?;
                }
            } else {
                let flat: Vec<f32> = word.layers.concat();
                self.append(key.clone(), vec![n_layers, d_model], &flat)?;
            }

            self.metadata.insert(key, sentence.sentence.clone());
            self.occurrences.insert(name, occurrence + 1);
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let this = *self;
        let header = this.header()?;
        info!(
            "Writing {} tensors for {} words to {} ({} occurrences over the limit)",
            this.entries.len(),
            this.occurrences.len(),
            this.path.display(),
            this.skipped
        );

        let mut spool = this
            .spool
            .into_inner()
            .map_err(IntoInnerError::into_error)?;
        spool.seek(SeekFrom::Start(0))?;

        let file = File::create(&this.path)
            .with_context(|| format!("Failed to write container {}", this.path.display()))?;
        let mut out = BufWriter::new(file);
        out.write_all(&(header.len() as u64).to_le_bytes())?;
        out.write_all(&header)?;
        let copied = std::io::copy(&mut spool, &mut out)?;
        anyhow::ensure!(
            copied as usize == this.offset,
            "Spool holds {} bytes, expected {}",
            copied,
            this.offset
        );
        out.flush()?;
        Ok(())
    }
}

/// Random access to a container written by [`ContainerSink`]
pub struct ContainerReader {
    data: Vec<u8>,
    metadata: HashMap<String, String>,
    /// Sanitized word -> number of stored occurrences
    occurrences: BTreeMap<String, usize>,
}

impl ContainerReader {
    pub fn open(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read container {}", path.display()))?;
        let (_, header) = SafeTensors::read_metadata(&data)
            .with_context(|| format!("Failed to parse container header {}", path.display()))?;
        let metadata = header.metadata().clone().unwrap_or_default();

        let mut occurrences = BTreeMap::new();
        let st = SafeTensors::deserialize(&data)?;
        for name in st.names() {
            let mut parts = name.split('/');
            if parts.next() != Some(KEY_ROOT) {
                continue;
            }
            if let (Some(word), Some(Ok(index))) =
                (parts.next(), parts.next().map(str::parse::<usize>))
            {
                let count = occurrences.entry(word.to_string()).or_insert(0);
                *count = (*count).max(index + 1);
            }
        }

        Ok(Self {
            data,
            metadata,
            occurrences,
        })
    }

    /// Stored words (sanitized form), sorted
    pub fn words(&self) -> Vec<&str> {
        self.occurrences.keys().map(String::as_str).collect()
    }

    /// Number of stored occurrences of `word`
    pub fn occurrences(&self, word: &str) -> usize {
        self.occurrences
            .get(&sanitize_key(word))
            .copied()
            .unwrap_or(0)
    }

    /// Run-level or per-occurrence metadata entry
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Layer vectors and source sentence of one occurrence
    pub fn get(&self, word: &str, occurrence: usize) -> Result<(Vec<Vec<f32>>, String)> {
        let key = occurrence_key(word, occurrence);
        let context = self
            .metadata(&key)
            .with_context(|| format!("No occurrence stored under {key}"))?
            .to_string();

        let st = SafeTensors::deserialize(&self.data)?;
        let layers = if let Ok(view) = st.tensor(&key) {
            tensor_from_view(&view)?.to_vec2::<f32>()?
        } else {
            let mut layers = Vec::new();
            while let Ok(view) = st.tensor(&format!("{key}/{}", layers.len())) {
                layers.push(tensor_from_view(&view)?.to_vec1::<f32>()?);
            }
            anyhow::ensure!(!layers.is_empty(), "No tensors stored under {key}");
            layers
        };

        Ok((layers, context))
    }
}

fn tensor_from_view(view: &TensorView<'_>) -> Result<Tensor> {
    anyhow::ensure!(
        view.dtype() == safetensors::Dtype::F32,
        "Unsupported container dtype: {:?}",
        view.dtype()
    );
    let tensor = Tensor::from_raw_buffer(view.data(), DType::F32, view.shape(), &Device::Cpu)?;
    Ok(tensor)
}
