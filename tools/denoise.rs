use anyhow::{bail, Context, Result};
use noisered::utils::{calculate_rms, linear_to_db};
use noisered::{ContourDirectory, FramingMode, SubtractionParameters, TransformContext};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Log filter used when `RUST_LOG` is not set
const DEFAULT_LOG_FILTER: &str = "warn";

const USAGE: &str = "usage: denoise <input.raw|input.wav> <output> \
[--config subtraction.conf] [--contours 60phon] [--size 512] [--rate 16000] [--ola]";

struct Options {
    input: PathBuf,
    output: PathBuf,
    config: PathBuf,
    contours: PathBuf,
    transform_size: usize,
    sample_rate: u32,
    overlap_add: bool,
}

fn parse_options() -> Result<Options> {
    let mut args = std::env::args().skip(1);
    let mut positional = Vec::new();
    let mut options = Options {
        input: PathBuf::new(),
        output: PathBuf::new(),
        config: PathBuf::from("subtraction.conf"),
        contours: PathBuf::from("60phon"),
        transform_size: 512,
        sample_rate: 16000,
        overlap_add: false,
    };

    while let Some(arg) = args.next() {
        let mut value = |name: &str| {
            args.next()
                .with_context(|| format!("{} needs a value\n{}", name, USAGE))
        };
        match arg.as_str() {
            "--config" => options.config = PathBuf::from(value("--config")?),
            "--contours" => options.contours = PathBuf::from(value("--contours")?),
            "--size" => {
                options.transform_size = value("--size")?
                    .parse()
                    .context("--size must be an even integer")?
            }
            "--rate" => {
                options.sample_rate = value("--rate")?
                    .parse()
                    .context("--rate must be a positive integer")?
            }
            "--ola" => options.overlap_add = true,
            flag if flag.starts_with("--") => bail!("unknown option '{}'\n{}", flag, USAGE),
            _ => positional.push(PathBuf::from(&arg)),
        }
    }

    if positional.len() != 2 {
        bail!("{}", USAGE);
    }
    options.output = positional.pop().unwrap_or_default();
    options.input = positional.pop().unwrap_or_default();
    Ok(options)
}

fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Route `log` records from the library to stderr
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_writer(std::io::stderr)
        .init();
}

fn is_wav(path: &Path) -> bool {
    path.extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("wav"))
}

fn main() -> Result<()> {
    init_logging();
    let options = parse_options()?;

    let mut context = TransformContext::new(options.transform_size, options.sample_rate)
        .context("invalid transform configuration")?;
    if options.overlap_add {
        context.set_framing(FramingMode::OverlapAdd);
    }

    let parameters = if options.config.exists() {
        SubtractionParameters::from_file(&options.config)
            .with_context(|| format!("failed to load '{}'", options.config.display()))?
    } else {
        log::info!(
            "No parameter file at '{}', using defaults",
            options.config.display()
        );
        SubtractionParameters::default()
    };
    parameters.validate()?;
    parameters
        .apply(&mut context, Arc::new(ContourDirectory::new(&options.contours)))
        .context("failed to configure subtraction")?;

    let samples = if is_wav(&options.input) {
        context.read_wav(&options.input)
    } else {
        context.read_pcm_file(&options.input)
    }
    .with_context(|| format!("failed to read '{}'", options.input.display()))?;
    log::info!("Loaded {} samples from '{}'", samples, options.input.display());

    context.process().context("processing failed")?;

    if is_wav(&options.output) {
        context.write_wav(&options.output)
    } else {
        context.write_pcm_file(&options.output)
    }
    .with_context(|| format!("failed to write '{}'", options.output.display()))?;

    println!("Denoised '{}' -> '{}'", options.input.display(), options.output.display());
    println!("  samples     : {}", samples);
    println!("  sample rate : {} Hz", context.sample_rate());
    println!("  transform   : {} ({:?})", context.transform_size(), context.framing());
    println!(
        "  strategies  : {} / {}{}",
        context.estimator().borrow().algorithm(),
        context.subtractor().borrow().algorithm(),
        if context.bypass() { " (bypass)" } else { "" }
    );
    println!("  iterations  : {}", context.iterations());
    println!(
        "  level       : {:.1} dBFS -> {:.1} dBFS",
        linear_to_db(calculate_rms(context.original_data())),
        linear_to_db(calculate_rms(context.sample_data()))
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use noisered::EstimationAlgorithm;
    use std::io::Write;
    use std::sync::Mutex;
    use tracing_subscriber::util::SubscriberInitExt;

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLog {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[test]
    fn test_unknown_tokens_are_reported() {
        let captured = CapturedLog::default();
        let writer = captured.clone();
        let _guard = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(DEFAULT_LOG_FILTER))
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish()
            .set_default();

        let mut context = TransformContext::new(64, 16000).unwrap();
        let parameters: SubtractionParameters = "2 0.02 0.05 0.0005 1 kalman spectral".parse().unwrap();
        parameters
            .apply(&mut context, Arc::new(ContourDirectory::new("60phon")))
            .unwrap();
        log::info!("loaded samples");

        let text = captured.text();
        assert!(text.contains("WARN"), "{}", text);
        assert!(text.contains("kalman"), "{}", text);
        assert!(text.contains("spectral"), "{}", text);
        assert!(!text.contains("loaded samples"), "{}", text);
        assert_eq!(context.estimator().borrow().algorithm(), EstimationAlgorithm::Simple);
    }
}
