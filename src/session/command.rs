//! Structured remote commands.
//!
//! Pipeline code never builds shell strings by hand. It describes what it
//! wants as a [`RemoteCommand`], and transports either render it with every
//! operand quoted ([`RemoteCommand::to_shell`]) or interpret it directly.

use crate::core::models::{ArchiveFormat, HashAlgorithm};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    /// `mkdir -p <path>`
    MakeDir(String),
    /// `test -e <path>`; exit 0 when the path exists.
    Exists(String),
    /// `mv <from> <to>`
    Move { from: String, to: String },
    /// Overlay `from` onto `to`. Directories copy their contents.
    Copy {
        from: String,
        to: String,
        recursive: bool,
    },
    /// `rm -rf <path>`
    RemoveAll(String),
    /// `rm -f <path>`
    RemoveFile(String),
    /// Unpack `archive` into the directory `into`.
    Extract {
        format: ArchiveFormat,
        archive: String,
        into: String,
    },
    /// `<hashtool> <path>`
    Hash {
        algorithm: HashAlgorithm,
        path: String,
    },
    /// `tail -n <lines> <path>`
    Tail { path: String, lines: usize },
    /// `cat <path>`
    Cat(String),
    /// Backups of a target, one per line, sorted oldest first.
    ListBackups { prefix: String },
    /// Receive stdin into `path`.
    Receive(String),
    /// Run each command in turn, stopping at the first failure.
    Chain(Vec<RemoteCommand>),
}

impl RemoteCommand {
    pub fn chain(commands: impl IntoIterator<Item = RemoteCommand>) -> Self {
        RemoteCommand::Chain(commands.into_iter().collect())
    }

    /// Render as a POSIX shell command line.
    pub fn to_shell(&self) -> String {
        match self {
            Self::MakeDir(path) => format!("mkdir -p -- {}", quote(path)),
            Self::Exists(path) => format!("test -e {}", quote(path)),
            Self::Move { from, to } => format!("mv -- {} {}", quote(from), quote(to)),
            Self::Copy {
                from,
                to,
                recursive: true,
            } => format!("cp -Rf -- {}/. {}", quote(from), quote(to)),
            Self::Copy {
                from,
                to,
                recursive: false,
            } => format!("cp -f -- {} {}", quote(from), quote(to)),
            Self::RemoveAll(path) => format!("rm -rf -- {}", quote(path)),
            Self::RemoveFile(path) => format!("rm -f -- {}", quote(path)),
            Self::Extract {
                format: ArchiveFormat::Zip,
                archive,
                into,
            } => format!("unzip -o -q {} -d {}", quote(archive), quote(into)),
            Self::Extract {
                format: ArchiveFormat::TarGz,
                archive,
                into,
            } => format!("tar -xzf {} -C {}", quote(archive), quote(into)),
            Self::Hash { algorithm, path } => {
                format!("{} -- {}", algorithm.remote_tool(), quote(path))
            }
            Self::Tail { path, lines } => format!("tail -n {} -- {}", lines, quote(path)),
            Self::Cat(path) => format!("cat -- {}", quote(path)),
            // The glob must stay outside the quotes to expand.
            Self::ListBackups { prefix } => {
                format!("ls -1d -- {}* 2>/dev/null | sort || true", quote(prefix))
            }
            Self::Receive(path) => format!("cat > {}", quote(path)),
            Self::Chain(commands) => commands
                .iter()
                .map(RemoteCommand::to_shell)
                .collect::<Vec<_>>()
                .join(" && "),
        }
    }
}

impl std::fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_shell())
    }
}

/// Quote a single shell word. Words made only of safe characters are left
/// bare so logged commands stay readable.
pub fn quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"/._-+=:,@%".contains(&b));

    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
