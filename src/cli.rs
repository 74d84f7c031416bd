use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate api docs in markdown format
    #[cfg(feature = "markdown-docs")]
    #[clap(hide = true)]
    MarkdownDocs {},

    /// Start mnemo as a service.
    Daemon {},

    /// Capture a url or a piece of text
    Capture {
        /// Url to capture
        url: Option<String>,

        /// Item title
        #[clap(short, long)]
        title: Option<String>,

        /// Text to store instead of whatever the url yields
        #[clap(short, long)]
        content: Option<String>,

        /// Don't fetch the url server-side
        #[clap(long, default_value = "false")]
        no_fetch: bool,

        /// Owner to file the item under
        #[clap(short, long)]
        owner: Option<String>,
    },

    /// Search captured items
    Search {
        /// Text matched against title, summary and keywords
        #[clap(allow_hyphen_values = true)]
        query: Option<String>,

        /// Filter by emotion label
        #[clap(short, long)]
        emotion: Option<String>,

        /// Widen the query through the tag index
        #[clap(short, long, default_value = "false")]
        semantic: bool,

        /// Maximum number of results
        #[clap(short, long)]
        limit: Option<usize>,

        #[clap(short, long)]
        owner: Option<String>,

        /// Print the count
        #[clap(short = 'c', long, default_value = "false")]
        count: bool,
    },

    /// Show the newest captures
    Timeline {
        #[clap(short, long)]
        limit: Option<usize>,

        #[clap(short, long)]
        owner: Option<String>,
    },

    /// Aggregate counts over captured items
    Insights {
        #[clap(short, long)]
        owner: Option<String>,
    },

    /// Show enrichment queue state
    Status {},

    /// Delete one item by id
    Delete {
        id: u64,

        /// Auto confirm
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },

    /// Export the data files as a tar.gz archive
    Backup {
        /// Output path. Defaults to a timestamped file, or stdout when piped.
        #[clap(short, long)]
        output: Option<PathBuf>,
    },

    /// Restore data files from a backup archive
    Import {
        /// Archive path. Reads stdin when piped.
        archive: Option<PathBuf>,

        /// Auto confirm
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },
}
