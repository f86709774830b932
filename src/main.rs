use anyhow::Result;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "bubble-translator-rust",
    version,
    about = "Overlay translated text onto the speech bubbles of an image"
)]
struct Cli {
    /// Image to translate (png/jpeg/webp/gif/bmp/tiff)
    image: String,

    /// Detector output for the image as JSON (logits, pred_boxes, num_queries, num_classes)
    #[arg(short = 'd', long = "detections")]
    detections: String,

    /// Where to write the composited image (default: <image>.translated.<ext>)
    #[arg(short = 'o', long = "output")]
    output: Option<String>,

    /// Also write the detection list as JSON to this file
    #[arg(long = "metadata")]
    metadata: Option<String>,

    /// Source language code, or AUTO to detect (overrides settings)
    #[arg(short = 'L', long = "source-lang")]
    source_lang: Option<String>,

    /// Target language code (overrides settings)
    #[arg(short = 'l', long = "lang")]
    lang: Option<String>,

    /// OCR service: tesseract | google_cloud_vision
    #[arg(long = "ocr")]
    ocr: Option<String>,

    /// Translation service: deepl | google_translate
    #[arg(long = "translator")]
    translator: Option<String>,

    /// Read extra settings from a local TOML file
    #[arg(short = 'r', long = "read-settings")]
    read_settings: Option<String>,

    /// Enable verbose logging
    #[arg(long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    bubble_translator_rust::logging::init(cli.verbose)?;

    let config = bubble_translator_rust::Config {
        image_path: cli.image,
        detections_path: cli.detections,
        output_path: cli.output,
        metadata_path: cli.metadata,
        source_lang: cli.source_lang,
        target_lang: cli.lang,
        ocr_service: cli.ocr,
        translation_service: cli.translator,
        settings_path: cli.read_settings,
    };
    let summary = bubble_translator_rust::run(config).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
