//! Shell command tokenization and the file-touching command table.
//!
//! The tokenizer honors single quotes, double quotes, and backslash
//! escapes, and splits a command line into segments at unquoted `&&`,
//! `||`, `;`, and `|`. Each segment is evaluated independently; the
//! strictest decision wins at the engine level.

use std::collections::BTreeSet;

use crate::rules::FileOperation;

/// One parsed command segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSegment {
    /// Parsed argv, quotes removed.
    pub argv: Vec<String>,
}

impl CommandSegment {
    /// The basename of `argv[0]`, if present.
    #[must_use]
    pub fn basename(&self) -> Option<&str> {
        self.argv
            .first()
            .map(|a| a.rsplit('/').next().unwrap_or(a.as_str()))
    }

    /// The segment re-joined for whole-line pattern matching.
    #[must_use]
    pub fn line(&self) -> String {
        self.argv.join(" ")
    }
}

/// Tokenization failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenizeError {
    /// A quote was opened but never closed.
    UnterminatedQuote,
    /// The command contained no words.
    Empty,
}

/// Split a command line into segments of parsed argv.
///
/// # Errors
///
/// [`TokenizeError::UnterminatedQuote`] for dangling quotes,
/// [`TokenizeError::Empty`] when nothing remains after parsing.
pub fn tokenize(command: &str) -> Result<Vec<CommandSegment>, TokenizeError> {
    let mut segments = Vec::new();
    let mut argv: Vec<String> = Vec::new();
    let mut word = String::new();
    let mut in_word = false;

    let mut chars = command.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => word.push(inner),
                        None => return Err(TokenizeError::UnterminatedQuote),
                    }
                }
            },
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(esc) => word.push(esc),
                            None => return Err(TokenizeError::UnterminatedQuote),
                        },
                        Some(inner) => word.push(inner),
                        None => return Err(TokenizeError::UnterminatedQuote),
                    }
                }
            },
            '\\' => {
                if let Some(esc) = chars.next() {
                    in_word = true;
                    word.push(esc);
                }
            },
            c if c.is_whitespace() => {
                if in_word {
                    argv.push(std::mem::take(&mut word));
                    in_word = false;
                }
            },
            ';' => {
                flush_segment(&mut segments, &mut argv, &mut word, &mut in_word);
            },
            '&' | '|' => {
                // `&&` / `||` / `|` all end the segment; a doubled
                // operator consumes its twin.
                if chars.peek() == Some(&c) {
                    chars.next();
                }
                flush_segment(&mut segments, &mut argv, &mut word, &mut in_word);
            },
            c => {
                in_word = true;
                word.push(c);
            },
        }
    }
    flush_segment(&mut segments, &mut argv, &mut word, &mut in_word);

    if segments.is_empty() {
        return Err(TokenizeError::Empty);
    }
    Ok(segments)
}

fn flush_segment(
    segments: &mut Vec<CommandSegment>,
    argv: &mut Vec<String>,
    word: &mut String,
    in_word: &mut bool,
) {
    if *in_word {
        argv.push(std::mem::take(word));
        *in_word = false;
    }
    if !argv.is_empty() {
        segments.push(CommandSegment {
            argv: std::mem::take(argv),
        });
    }
}

/// File accesses implied by a command's path arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImpliedAccess {
    /// The path argument as written.
    pub path: String,
    /// The file operations the command implies on it.
    pub operations: BTreeSet<FileOperation>,
}

fn ops(list: &[FileOperation]) -> BTreeSet<FileOperation> {
    list.iter().copied().collect()
}

/// Whether `basename` is in the known file-touching command set.
#[must_use]
pub fn is_file_touching(basename: &str) -> bool {
    matches!(
        basename,
        "cat" | "head" | "tail" | "less" | "more" | "cp" | "mv" | "rm" | "chmod" | "chown"
            | "vi" | "vim" | "nano" | "code" | "open" | "xdg-open" | "scp" | "rsync" | "tar"
            | "zip" | "unzip" | "gzip" | "gunzip" | "base64"
    )
}

/// Extract the file accesses a segment implies.
///
/// Non-flag arguments are treated as paths. Copy-like commands read
/// every source and write the final destination; `mv` also deletes its
/// sources; `chmod`/`chown` skip their mode/owner argument.
#[must_use]
pub fn implied_file_access(segment: &CommandSegment) -> Vec<ImpliedAccess> {
    let Some(basename) = segment.basename() else {
        return Vec::new();
    };
    if !is_file_touching(basename) {
        return Vec::new();
    }

    let args: Vec<&String> = segment
        .argv
        .iter()
        .skip(1)
        .filter(|a| !a.starts_with('-') && !a.is_empty())
        .collect();

    match basename {
        "cat" | "head" | "tail" | "less" | "more" | "base64" => paths_with(&args, &[FileOperation::Read]),
        "rm" => paths_with(&args, &[FileOperation::Delete]),
        "chmod" | "chown" => {
            // First non-flag argument is the mode/owner, not a path.
            paths_with(args.get(1..).unwrap_or(&[]), &[FileOperation::Write])
        },
        "vi" | "vim" | "nano" | "code" | "open" | "xdg-open" => {
            paths_with(&args, &[FileOperation::Read, FileOperation::Write])
        },
        "cp" | "scp" | "rsync" => sources_and_dest(
            &args,
            &[FileOperation::Read],
            &[FileOperation::Write, FileOperation::Create],
        ),
        "mv" => sources_and_dest(
            &args,
            &[FileOperation::Read, FileOperation::Delete],
            &[FileOperation::Write, FileOperation::Create],
        ),
        "tar" | "zip" | "gzip" | "gunzip" | "unzip" => {
            paths_with(&args, &[FileOperation::Read, FileOperation::Write])
        },
        _ => Vec::new(),
    }
}

fn paths_with(args: &[&String], operations: &[FileOperation]) -> Vec<ImpliedAccess> {
    args.iter()
        .map(|path| ImpliedAccess {
            path: (*path).clone(),
            operations: ops(operations),
        })
        .collect()
}

fn sources_and_dest(
    args: &[&String],
    source_ops: &[FileOperation],
    dest_ops: &[FileOperation],
) -> Vec<ImpliedAccess> {
    let mut out = Vec::new();
    let Some((dest, sources)) = args.split_last() else {
        return out;
    };
    for src in sources {
        out.push(ImpliedAccess {
            path: (*src).clone(),
            operations: ops(source_ops),
        });
    }
    out.push(ImpliedAccess {
        path: (*dest).clone(),
        operations: ops(dest_ops),
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_tokenize() {
        let segs = tokenize("cat /etc/hosts").unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].argv, vec!["cat", "/etc/hosts"]);
        assert_eq!(segs[0].basename(), Some("cat"));
    }

    #[test]
    fn test_quotes_preserve_spaces() {
        let segs = tokenize(r#"cat "my file.txt" 'other file'"#).unwrap();
        assert_eq!(segs[0].argv, vec!["cat", "my file.txt", "other file"]);
    }

    #[test]
    fn test_backslash_escape() {
        let segs = tokenize(r"cat my\ file").unwrap();
        assert_eq!(segs[0].argv, vec!["cat", "my file"]);
    }

    #[test]
    fn test_segment_splitting() {
        let segs = tokenize("ls && cat /x; echo hi | grep h").unwrap();
        let names: Vec<_> = segs.iter().filter_map(CommandSegment::basename).collect();
        assert_eq!(names, vec!["ls", "cat", "echo", "grep"]);
    }

    #[test]
    fn test_unterminated_quote() {
        assert_eq!(tokenize("cat 'oops"), Err(TokenizeError::UnterminatedQuote));
    }

    #[test]
    fn test_empty_command() {
        assert_eq!(tokenize("   "), Err(TokenizeError::Empty));
    }

    #[test]
    fn test_basename_strips_directory() {
        let segs = tokenize("/usr/bin/cat /etc/shadow").unwrap();
        assert_eq!(segs[0].basename(), Some("cat"));
    }

    #[test]
    fn test_read_commands() {
        let segs = tokenize("cat /home/u/.ssh/id_rsa").unwrap();
        let access = implied_file_access(&segs[0]);
        assert_eq!(access.len(), 1);
        assert_eq!(access[0].path, "/home/u/.ssh/id_rsa");
        assert!(access[0].operations.contains(&FileOperation::Read));
    }

    #[test]
    fn test_rm_implies_delete() {
        let segs = tokenize("rm -rf /tmp/scratch").unwrap();
        let access = implied_file_access(&segs[0]);
        assert_eq!(access.len(), 1);
        assert!(access[0].operations.contains(&FileOperation::Delete));
    }

    #[test]
    fn test_cp_source_and_dest() {
        let segs = tokenize("cp /a /b /dest").unwrap();
        let access = implied_file_access(&segs[0]);
        assert_eq!(access.len(), 3);
        assert!(access[0].operations.contains(&FileOperation::Read));
        assert!(access[1].operations.contains(&FileOperation::Read));
        assert!(access[2].operations.contains(&FileOperation::Write));
        assert!(access[2].operations.contains(&FileOperation::Create));
    }

    #[test]
    fn test_mv_deletes_source() {
        let segs = tokenize("mv /a /dest").unwrap();
        let access = implied_file_access(&segs[0]);
        assert!(access[0].operations.contains(&FileOperation::Delete));
        assert!(access[1].operations.contains(&FileOperation::Create));
    }

    #[test]
    fn test_chmod_skips_mode_argument() {
        let segs = tokenize("chmod 600 /etc/passwd").unwrap();
        let access = implied_file_access(&segs[0]);
        assert_eq!(access.len(), 1);
        assert_eq!(access[0].path, "/etc/passwd");
        assert!(access[0].operations.contains(&FileOperation::Write));
    }

    #[test]
    fn test_non_file_command_implies_nothing() {
        let segs = tokenize("echo hello /etc/passwd").unwrap();
        assert!(implied_file_access(&segs[0]).is_empty());
    }

    #[test]
    fn test_flags_are_not_paths() {
        let segs = tokenize("tail -n 50 /var/log/syslog").unwrap();
        let access = implied_file_access(&segs[0]);
        // "-n" is skipped; "50" is (conservatively) treated as a path
        // along with the real file.
        assert!(access.iter().any(|a| a.path == "/var/log/syslog"));
        assert!(access.iter().all(|a| a.path != "-n"));
    }
}
