use serde::Serialize;
use serde_json::{json, Value};
use std::env;
use std::path::Path;
use std::process::ExitCode;
use txn_categorizer::{
    build_decision_source, preview_classification, run_with_config, ClassifyError,
    ClassifyRunRequest, ReviewMode, RunConfig,
};

const USAGE: &str = "usage: txn-categorizer [--config FILE] [--model FILE] [--input FILE] \
[--output FILE] [--report FILE] [--decisions FILE] [--save-decisions FILE] \
[--threshold X] [--review-mode MODE] [--preview] [--pretty] [--verbose]";

const VALUE_FLAGS: &[&str] = &[
    "--config",
    "--model",
    "--input",
    "--output",
    "--report",
    "--decisions",
    "--save-decisions",
    "--threshold",
    "--review-mode",
];
const BOOL_FLAGS: &[&str] = &["--preview", "--pretty", "--verbose", "--help"];

#[derive(Debug, Serialize)]
struct CliErrorBody {
    category: String,
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status")]
enum CliResponse {
    #[serde(rename = "success")]
    Success { payload: Value },
    #[serde(rename = "error")]
    Error { error: CliErrorBody },
}

fn error_response(err: &ClassifyError) -> CliResponse {
    CliResponse::Error {
        error: CliErrorBody {
            category: err.category().to_string(),
            message: err.to_string(),
            error_type: "ClassifyError".to_string(),
        },
    }
}

fn parse_bool_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|arg| arg == flag)
}

fn flag_value(args: &[String], flag: &str) -> Result<Option<String>, ClassifyError> {
    let Some(pos) = args.iter().position(|arg| arg == flag) else {
        return Ok(None);
    };
    match args.get(pos + 1) {
        Some(v) if !v.starts_with("--") => Ok(Some(v.clone())),
        _ => Err(ClassifyError::Config(format!("{flag} needs a value"))),
    }
}

fn check_known_flags(args: &[String]) -> Result<(), ClassifyError> {
    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        if VALUE_FLAGS.contains(&arg) {
            i += 2;
        } else if BOOL_FLAGS.contains(&arg) {
            i += 1;
        } else {
            return Err(ClassifyError::Config(format!("unknown argument: {arg}\n{USAGE}")));
        }
    }
    Ok(())
}

fn request_from_args(args: &[String]) -> Result<ClassifyRunRequest, ClassifyError> {
    check_known_flags(args)?;
    let review_threshold = flag_value(args, "--threshold")?
        .map(|raw| {
            raw.trim()
                .parse::<f64>()
                .map_err(|_| ClassifyError::Config(format!("--threshold is not a number: {raw}")))
        })
        .transpose()?;
    let review_mode = flag_value(args, "--review-mode")?
        .map(|raw| ReviewMode::parse(&raw))
        .transpose()?;

    let overrides = ClassifyRunRequest {
        model_path: flag_value(args, "--model")?,
        source_path: flag_value(args, "--input")?,
        output_path: flag_value(args, "--output")?,
        report_path: flag_value(args, "--report")?,
        decisions_path: flag_value(args, "--decisions")?,
        save_decisions_path: flag_value(args, "--save-decisions")?,
        review_threshold,
        non_reportable_categories: None,
        review_mode,
    };
    let base = match flag_value(args, "--config")? {
        Some(path) => ClassifyRunRequest::from_json_file(Path::new(&path))?,
        None => ClassifyRunRequest::default(),
    };
    Ok(base.merged_with(overrides))
}

fn dispatch(args: &[String]) -> Result<Value, ClassifyError> {
    let req = request_from_args(args)?;
    if parse_bool_flag(args, "--preview") {
        return preview_classification(req);
    }

    let cfg = RunConfig::resolve(req)?;
    log::debug!(
        "model={} input={} output={} review_mode={}",
        cfg.model_path.to_string_lossy(),
        cfg.source_path.to_string_lossy(),
        cfg.output_path.to_string_lossy(),
        cfg.review_mode.as_str()
    );
    let mut source = build_decision_source(&cfg)?;
    let outcome = run_with_config(cfg, source.as_mut())?;
    println!();
    print!("{}", outcome.report().render_text());
    Ok(outcome.summary_json())
}

fn main() -> ExitCode {
    let args = env::args().skip(1).collect::<Vec<_>>();
    if parse_bool_flag(&args, "--help") {
        println!("{USAGE}");
        return ExitCode::SUCCESS;
    }
    let pretty = parse_bool_flag(&args, "--pretty");
    let verbose = parse_bool_flag(&args, "--verbose");

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if verbose { "debug" } else { "warn" }),
    )
    .init();

    let (resp, code) = match dispatch(&args) {
        Ok(payload) => (CliResponse::Success { payload }, ExitCode::SUCCESS),
        Err(err) => {
            log::error!("{err}");
            (error_response(&err), ExitCode::FAILURE)
        }
    };

    let out = if pretty {
        serde_json::to_string_pretty(&resp)
    } else {
        serde_json::to_string(&resp)
    }
    .unwrap_or_else(|e| {
        json!({
            "status": "error",
            "error": {
                "category": "IO_ERROR",
                "message": format!("serialize response failed: {e}"),
                "type": "SerializeError",
            }
        })
        .to_string()
    });

    println!("{out}");
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn flags_become_request_overrides() {
        let req = request_from_args(&args(&[
            "--model",
            "m.json",
            "--threshold",
            "0.7",
            "--review-mode",
            "replay-then-prompt",
            "--pretty",
        ]))
        .expect("request");
        assert_eq!(req.model_path.as_deref(), Some("m.json"));
        assert_eq!(req.review_threshold, Some(0.7));
        assert_eq!(req.review_mode, Some(ReviewMode::ReplayThenPrompt));
        assert_eq!(req.source_path, None);
    }

    #[test]
    fn bad_arguments_are_config_errors() {
        for bad in [
            args(&["--threshold", "high"]),
            args(&["--model"]),
            args(&["--model", "--pretty"]),
            args(&["--bogus"]),
            args(&["--review-mode", "sometimes"]),
        ] {
            let err = request_from_args(&bad).expect_err("should fail");
            assert_eq!(err.category(), "CONFIG_ERROR");
        }
    }

    #[test]
    fn error_envelope_shape() {
        let resp = error_response(&ClassifyError::DimensionMismatch {
            expected: 5,
            actual: 4,
        });
        let v = serde_json::to_value(&resp).expect("serialize");
        assert_eq!(v["status"], "error");
        assert_eq!(v["error"]["category"], "DIMENSION_MISMATCH");
        assert_eq!(v["error"]["type"], "ClassifyError");
    }
}
