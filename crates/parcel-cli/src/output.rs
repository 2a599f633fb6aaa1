/// Output format selected by `--json`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Human,
    Json,
}

impl OutputFormat {
    pub fn is_json(self) -> bool {
        matches!(self, OutputFormat::Json)
    }
}

/// Sink for command output, either human-readable or JSON
pub trait OutputFormatter {
    fn success(&self, message: &str);
    fn error(&self, message: &str);
    fn warn(&self, message: &str);
    fn info(&self, message: &str);
    /// One aligned `label: value` row of a summary block
    fn field(&self, label: &str, value: &str);
    fn print_json(&self, value: &serde_json::Value);
}

/// Width of the label column in summary blocks
const LABEL_WIDTH: usize = 12;

pub struct HumanFormatter;

impl OutputFormatter for HumanFormatter {
    fn success(&self, message: &str) {
        println!("\u{2713} {message}");
    }
    fn error(&self, message: &str) {
        eprintln!("\u{2717} Error: {message}");
    }
    fn warn(&self, message: &str) {
        eprintln!("\u{26a0} Warning: {message}");
    }
    fn info(&self, message: &str) {
        println!("  {message}");
    }
    fn field(&self, label: &str, value: &str) {
        println!("  {:<width$} {value}", format!("{label}:"), width = LABEL_WIDTH + 1);
    }
    fn print_json(&self, _value: &serde_json::Value) {}
}

/// Machine-readable output. Commands build one JSON document and hand it to
/// `print_json`; free-form text is dropped, errors and warnings go to stderr.
pub struct JsonFormatter;

impl OutputFormatter for JsonFormatter {
    fn success(&self, _message: &str) {}
    fn error(&self, message: &str) {
        eprintln!("{}", serde_json::json!({ "success": false, "error": message }));
    }
    fn warn(&self, message: &str) {
        eprintln!("{}", serde_json::json!({ "level": "warning", "message": message }));
    }
    fn info(&self, _message: &str) {}
    fn field(&self, _label: &str, _value: &str) {}
    fn print_json(&self, value: &serde_json::Value) {
        match serde_json::to_string_pretty(value) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("{}", serde_json::json!({ "success": false, "error": e.to_string() })),
        }
    }
}

pub fn get_formatter(format: OutputFormat) -> Box<dyn OutputFormatter> {
    match format {
        OutputFormat::Json => Box::new(JsonFormatter),
        OutputFormat::Human => Box::new(HumanFormatter),
    }
}

/// Renders a byte count with a binary unit, e.g. `1.5 MiB`
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
