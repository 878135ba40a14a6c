use clap::Parser;
use fast_core::CrcMode;

/// Command-line definition for fastcall.
#[derive(Parser, Debug)]
#[command(
    name = "fastcall",
    about = "Invoke an RPC method on a Fast server and print each emitted value",
    version
)]
pub struct Cli {
    /// Server address (HOST:PORT).
    pub address: String,

    /// RPC method name.
    pub method: String,

    /// Method arguments as a JSON array, e.g. '["one", 2]'.
    #[arg(default_value = "[]")]
    pub args: String,

    /// Abort the request if no terminal arrives within this many milliseconds.
    #[arg(long = "timeout", value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Abort the request after receiving this many values.
    #[arg(long = "abort-after", value_name = "N")]
    pub abort_after: Option<u64>,

    /// Checksum compatibility mode: "old", "new", or "old-new".
    #[arg(long = "crc-mode", default_value = "old-new")]
    pub crc_mode: CrcMode,

    /// Print the client introspection snapshot to stderr after the call.
    #[arg(long)]
    pub snapshot: bool,

    /// Emit engine events to stderr (repeat for more detail).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Parse the positional JSON arguments; they must form an array.
    pub fn parse_args(&self) -> Result<Vec<serde_json::Value>, String> {
        match serde_json::from_str(&self.args) {
            Ok(serde_json::Value::Array(values)) => Ok(values),
            Ok(_) => Err("arguments must be a JSON array".into()),
            Err(e) => Err(format!("arguments are not valid JSON: {e}")),
        }
    }
}
