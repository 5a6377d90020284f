use clap::{Parser, Subcommand};

/// pricegate: a metered, token-gated gateway for historical prices
#[derive(Parser)]
#[command(name = "pricegate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to bind (defaults to PRICEGATE_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Run the Access Manager in-process instead of calling PRICEGATE_ACCESS_URL
        #[arg(long)]
        embedded_access: bool,
    },

    /// Start the Access Manager RPC server
    Access {
        /// Port to bind (defaults to PRICEGATE_ACCESS_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage access tokens directly against the ledger
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Issue a new token
    Create {
        #[arg(long, value_delimiter = ',', default_value = "read:prices")]
        permissions: Vec<String>,
        /// Lifetime in seconds (defaults to PRICEGATE_TOKEN_TTL_SECS)
        #[arg(long)]
        ttl: Option<i64>,
    },
    /// Show remaining quota, expiry, and permissions
    Info { token: String },
    /// Revoke a token
    Revoke { token: String },
}
