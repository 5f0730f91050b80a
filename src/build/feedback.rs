use colored::*;

pub struct FeedbackAnalyzer;

impl FeedbackAnalyzer {
    /// A hint for common compiler and linker failures, if one applies.
    pub fn analyze(output: &str) -> Option<String> {
        // 1. Entry point missing
        if output.contains("undefined reference to `main'")
            || output.contains("entry point must be defined")
            || output.contains("_main\", referenced from")
        {
            return Some(format!(
                "This unit has no {} function.\nBuild it with {} if it is meant to be a library.",
                "main()".bold().yellow(),
                "--shared".bold().green()
            ));
        }

        // 2. Unresolved symbols
        if output.contains("LNK2019")
            || output.contains("undefined reference to")
            || output.contains("Undefined symbols for architecture")
        {
            return Some(format!(
                "It looks like a {} error.\nThe symbol may live in a library: pass {} or declare it with {}.",
                "Linker".bold().red(),
                "-l <name>".bold().yellow(),
                "// @depends creator/library:version".bold().green()
            ));
        }

        // 3. Angle-bracket header not on the compiler's path
        if output.contains("fatal error: ") && output.contains("No such file or directory")
            || output.contains("file not found")
            || output.contains("cannot open include file")
        {
            return Some(format!(
                "It looks like a {} error.\nAdd the directory with {} or {} in incc.toml.",
                "Missing Header".bold().red(),
                "-I <dir>".bold().yellow(),
                "include_dirs".bold().yellow()
            ));
        }

        // 4. Stale or mismatched precompiled header
        if output.contains("precompiled header") && output.contains("not used") {
            return Some(format!(
                "A precompiled header was built with different flags.\nRun with {} to rebuild, or {} to skip them.",
                "--clean".bold().green(),
                "--no-pch".bold().green()
            ));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linker_error() {
        let err = "error LNK2019: unresolved external symbol foo";
        let msg = FeedbackAnalyzer::analyze(err).unwrap();
        assert!(msg.contains("Linker"));
        assert!(msg.contains("@depends"));
    }

    #[test]
    fn test_include_error() {
        let err = "fatal error: foo.h: No such file or directory";
        let msg = FeedbackAnalyzer::analyze(err).unwrap();
        assert!(msg.contains("Missing Header"));
        assert!(msg.contains("include_dirs"));
    }

    #[test]
    fn test_main_error() {
        let err = "undefined reference to `main'";
        let msg = FeedbackAnalyzer::analyze(err).unwrap();
        assert!(msg.contains("--shared"));
    }

    #[test]
    fn test_pch_mismatch() {
        let err = "warning: precompiled header '/b/pch/a.hpp.gch' not used because it was built with different flags";
        assert!(FeedbackAnalyzer::analyze(err).unwrap().contains("--no-pch"));
    }

    #[test]
    fn test_unknown_output() {
        assert!(FeedbackAnalyzer::analyze("error: expected ';' before '}'").is_none());
    }
}
