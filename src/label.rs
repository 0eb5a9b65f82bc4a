use std::path::Path;

/// How a benchmark shows up in the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchmarkLabel {
    pub name: String,
    pub input: Option<String>,
}

impl BenchmarkLabel {
    pub fn input_or_empty(&self) -> &str {
        self.input.as_deref().unwrap_or("")
    }
}

/// Which [`Labeler`] names the benchmarks in the report.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LabelStyle {
    /// Executable name plus the last path-like argument as input
    #[default]
    Path,
    /// The whole command line, no input
    Command,
}

impl LabelStyle {
    pub fn labeler(self) -> Box<dyn Labeler> {
        match self {
            LabelStyle::Path => Box::new(PathLabeler),
            LabelStyle::Command => Box::new(CommandLabeler),
        }
    }
}

/// Derives report labels from a benchmark's argument vector.
pub trait Labeler {
    fn label(&self, argv: &[String]) -> BenchmarkLabel;
}

/// Labels by path segments: the executable's file name is the benchmark and
/// the last component of the final path-like argument is the input.
///
/// `./disparity/disparity ../data/vga` becomes `disparity` / `vga`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PathLabeler;

fn last_component(path: &str) -> Option<&str> {
    Path::new(path.trim_end_matches('/'))
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
}

impl Labeler for PathLabeler {
    fn label(&self, argv: &[String]) -> BenchmarkLabel {
        let name = argv
            .first()
            .map(|exe| last_component(exe).unwrap_or(exe).to_string())
            .unwrap_or_default();
        let input = argv
            .iter()
            .skip(1)
            .rev()
            .find(|arg| arg.contains('/'))
            .and_then(|arg| last_component(arg))
            .map(str::to_string);
        BenchmarkLabel { name, input }
    }
}

/// Uses the whole command line as the name and no input label.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandLabeler;

impl Labeler for CommandLabeler {
    fn label(&self, argv: &[String]) -> BenchmarkLabel {
        BenchmarkLabel {
            name: argv.join(" "),
            input: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_path_labeler_uses_last_two_components() {
        let label = PathLabeler.label(&argv("/opt/sd-vbs/disparity/disparity /opt/sd-vbs/data/vga"));
        assert_eq!(label.name, "disparity");
        assert_eq!(label.input.as_deref(), Some("vga"));
    }

    #[test]
    fn test_path_labeler_without_input() {
        let label = PathLabeler.label(&argv("/bin/true"));
        assert_eq!(label.name, "true");
        assert_eq!(label.input, None);
        assert_eq!(label.input_or_empty(), "");

        let label = PathLabeler.label(&argv("sleep 1"));
        assert_eq!(label.name, "sleep");
        assert_eq!(label.input, None);
    }

    #[test]
    fn test_path_labeler_trailing_slash() {
        let label = PathLabeler.label(&argv("./bench --size 3 data/large/"));
        assert_eq!(label.name, "bench");
        assert_eq!(label.input.as_deref(), Some("large"));
    }

    #[test]
    fn test_command_labeler() {
        let label = CommandLabeler.label(&argv("sleep   1"));
        assert_eq!(label.name, "sleep 1");
        assert_eq!(label.input, None);
    }

    #[test]
    fn test_label_style_picks_labeler() {
        let line = argv("./fft/fft ../data/small");
        assert_eq!(LabelStyle::default(), LabelStyle::Path);
        assert_eq!(LabelStyle::Path.labeler().label(&line).name, "fft");
        assert_eq!(
            LabelStyle::Command.labeler().label(&line).name,
            "./fft/fft ../data/small"
        );
    }
}
