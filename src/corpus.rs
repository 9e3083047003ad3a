//! Corpus and filter-vocabulary loading

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// A text corpus with one sentence per line, read lazily
#[derive(Debug, Clone)]
pub struct Corpus {
    path: PathBuf,
}

impl Corpus {
    /// Open a corpus file (contents are not read until iterated)
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        anyhow::ensure!(path.is_file(), "Corpus file not found: {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stream trimmed sentences in file order
    pub fn sentences(&self) -> Result<Sentences> {
        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open corpus {}", self.path.display()))?;
        Ok(Sentences {
            lines: BufReader::new(file).lines(),
        })
    }
}

/// Iterator over corpus sentences
pub struct Sentences {
    lines: Lines<BufReader<File>>,
}

impl Iterator for Sentences {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.lines.next().map(|line| {
            line.map(|l| l.trim().to_string())
                .context("Failed to read corpus line")
        })
    }
}

/// Set of lowercased words that extraction is restricted to
#[derive(Debug, Clone, Default)]
pub struct FilterVocab {
    words: HashSet<String>,
}

impl FilterVocab {
    /// Load from a file whose lines start with a word (extra columns ignored)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open filter vocabulary {}", path.display()))?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader(reader: impl BufRead) -> Result<Self> {
        let mut words = HashSet::new();
        for line in reader.lines() {
            let line = line?;
            if let Some(word) = line.split_whitespace().next() {
                words.insert(word.to_lowercase());
            }
        }
        Ok(Self { words })
    }

    /// Case-insensitive membership
    pub fn contains(&self, word: &str) -> bool {
        self.words.contains(&word.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}
