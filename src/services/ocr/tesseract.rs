// Local recognition through the tesseract CLI
//
// The region is piped in as PNG and read back as TSV, which carries the
// page/block/paragraph/line/word hierarchy with per-word confidences.

use async_trait::async_trait;
use image::{DynamicImage, GrayImage};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, trace};

use super::engine::{
    mean, union_box, RecognitionEngine, RecognizedBlock, RecognizedLine, RecognizedPage,
    RecognizedWord,
};
use crate::core::errors::{RecognitionError, RecognitionResult};
use crate::core::types::{BoundingBox, Credentials, OcrProvider, AUTO_LANGUAGE};
use crate::utils::image_ops::encode_png;

/// Map a settings language code to tesseract traineddata names.
/// `auto` resolves through `auto_language`, falling back to Japanese.
pub fn tesseract_language<'a>(code: &'a str, auto_language: &'a str) -> &'a str {
    match code.trim() {
        AUTO_LANGUAGE | "" => match auto_language.trim() {
            AUTO_LANGUAGE | "" => DEFAULT_AUTO_LANGUAGE,
            fallback => tesseract_language(fallback, DEFAULT_AUTO_LANGUAGE),
        },
        "ja" | "jpn" => "jpn",
        "ja-vert" | "jpn_vert" => "jpn_vert",
        "en" | "eng" => "eng",
        "ko" | "kor" => "kor",
        "zh" | "zh-CN" | "zh-Hans" | "chi_sim" => "chi_sim",
        "zh-TW" | "zh-Hant" | "chi_tra" => "chi_tra",
        "fr" => "fra",
        "de" => "deu",
        "es" => "spa",
        "it" => "ita",
        "pt" => "por",
        "ru" => "rus",
        other => other,
    }
}

/// Traineddata used for `auto` when nothing else is configured
pub const DEFAULT_AUTO_LANGUAGE: &str = "jpn";

pub struct TesseractEngine {
    binary: String,
    language: String,
    page_segmentation_mode: u32,
}

impl TesseractEngine {
    /// Check that `language` is installed, then build the engine
    pub async fn create(binary: &str, language: &str) -> RecognitionResult<Self> {
        let output = Command::new(binary)
            .arg("--list-langs")
            .output()
            .await
            .map_err(|e| RecognitionError::EngineUnavailable {
                language: language.to_string(),
                reason: format!("failed to run {} (is it installed?): {}", binary, e),
            })?;

        // Older releases print the list on stderr
        let listing = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let installed = listing.lines().any(|line| line.trim() == language);
        if !installed {
            return Err(RecognitionError::EngineUnavailable {
                language: language.to_string(),
                reason: "traineddata not installed".to_string(),
            });
        }

        Ok(Self {
            binary: binary.to_string(),
            language: language.to_string(),
            page_segmentation_mode: 6,
        })
    }

    async fn run_tsv(&self, png: Vec<u8>) -> RecognitionResult<String> {
        let mut child = Command::new(&self.binary)
            .arg("stdin")
            .arg("stdout")
            .arg("-l")
            .arg(&self.language)
            .arg("--psm")
            .arg(self.page_segmentation_mode.to_string())
            .arg("tsv")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&png).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RecognitionError::EngineFailed(format!(
                "tesseract exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl RecognitionEngine for TesseractEngine {
    fn provider(&self) -> OcrProvider {
        OcrProvider::LocalEngine
    }

    fn language(&self) -> &str {
        &self.language
    }

    #[instrument(skip(self, image, _credentials), fields(lang = %self.language))]
    async fn recognize(
        &self,
        image: &GrayImage,
        _credentials: &Credentials,
    ) -> RecognitionResult<RecognizedPage> {
        let png = encode_png(&DynamicImage::ImageLuma8(image.clone()))?;
        let tsv = self.run_tsv(png).await?;
        let page = parse_tsv(&tsv)?;
        debug!("tesseract returned {} blocks", page.blocks.len());
        Ok(page)
    }
}

#[derive(Default)]
struct LineAccumulator {
    bbox: Option<BoundingBox>,
    words: Vec<RecognizedWord>,
}

#[derive(Default)]
struct BlockAccumulator {
    bbox: Option<BoundingBox>,
    lines: BTreeMap<(u32, u32), LineAccumulator>,
}

fn parse_field<T: std::str::FromStr>(cols: &[&str], idx: usize, row: usize) -> RecognitionResult<T> {
    cols[idx].trim().parse().map_err(|_| {
        RecognitionError::MalformedOutput(format!(
            "tsv row {}: column {} is not a number: '{}'",
            row, idx, cols[idx]
        ))
    })
}

/// Parse tesseract TSV into blocks → lines → words.
///
/// Line and block confidences are the mean of their word confidences, since
/// TSV reports -1 for every level above words.
pub fn parse_tsv(tsv: &str) -> RecognitionResult<RecognizedPage> {
    let mut blocks: BTreeMap<u32, BlockAccumulator> = BTreeMap::new();

    for (idx, row) in tsv.lines().enumerate() {
        if idx == 0 || row.trim().is_empty() {
            continue;
        }
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 11 {
            trace!("Skipping short tsv row {}", idx);
            continue;
        }

        let level: u32 = parse_field(&cols, 0, idx)?;
        let block_num: u32 = parse_field(&cols, 2, idx)?;
        let par_num: u32 = parse_field(&cols, 3, idx)?;
        let line_num: u32 = parse_field(&cols, 4, idx)?;
        let left: f32 = parse_field(&cols, 6, idx)?;
        let top: f32 = parse_field(&cols, 7, idx)?;
        let width: f32 = parse_field(&cols, 8, idx)?;
        let height: f32 = parse_field(&cols, 9, idx)?;
        let conf: f32 = parse_field(&cols, 10, idx)?;
        let text = cols.get(11).map(|t| t.trim()).unwrap_or("");

        let bbox = BoundingBox::new(left, top, left + width, top + height);

        match level {
            2 => {
                blocks.entry(block_num).or_default().bbox = Some(bbox);
            }
            4 => {
                blocks
                    .entry(block_num)
                    .or_default()
                    .lines
                    .entry((par_num, line_num))
                    .or_default()
                    .bbox = Some(bbox);
            }
            5 if !text.is_empty() && conf >= 0.0 => {
                blocks
                    .entry(block_num)
                    .or_default()
                    .lines
                    .entry((par_num, line_num))
                    .or_default()
                    .words
                    .push(RecognizedWord {
                        text: text.to_string(),
                        confidence: conf,
                        bbox,
                    });
            }
            _ => {}
        }
    }

    let blocks = blocks
        .into_values()
        .filter_map(|block| {
            let lines: Vec<RecognizedLine> = block
                .lines
                .into_values()
                .filter(|line| !line.words.is_empty())
                .filter_map(|line| {
                    let confidence = mean(line.words.iter().map(|w| w.confidence))?;
                    let bbox = line.bbox.or_else(|| union_box(line.words.iter().map(|w| &w.bbox)))?;
                    Some(RecognizedLine {
                        confidence,
                        bbox,
                        words: line.words,
                    })
                })
                .collect();

            let confidence = mean(
                lines
                    .iter()
                    .flat_map(|l| l.words.iter().map(|w| w.confidence)),
            )?;
            let bbox = block.bbox.or_else(|| union_box(lines.iter().map(|l| &l.bbox)))?;
            Some(RecognizedBlock {
                confidence,
                bbox,
                lines,
            })
        })
        .collect();

    Ok(RecognizedPage { blocks })
}

/// Builds tesseract engines for the pool
pub struct TesseractFactory {
    binary: String,
    auto_language: String,
}

impl TesseractFactory {
    pub fn new(binary: impl Into<String>, auto_language: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            auto_language: auto_language.into(),
        }
    }

    pub async fn create(&self, language: &str) -> RecognitionResult<Arc<TesseractEngine>> {
        let traineddata = tesseract_language(language, &self.auto_language);
        let engine = TesseractEngine::create(&self.binary, traineddata).await?;
        Ok(Arc::new(engine))
    }
}
