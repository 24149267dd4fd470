use clap::{Parser, ValueEnum};

#[derive(Debug, Parser)]
#[clap(author, version, about)]
pub struct Cli {
    /// Capture files to process, in order
    #[clap(required = true)]
    pub files: Vec<String>,

    /// Output format
    #[clap(long, value_enum, default_value = "text")]
    pub format: Format,

    /// Path to the feature specification (JSON)
    #[clap(long)]
    pub features: String,

    /// Feature list to use, as key:id
    #[clap(long, default_value = "flows:0")]
    pub select: String,

    /// Output file ("-" for stdout); collector address for ipfix_stream
    #[clap(long, default_value = "-")]
    pub output: String,

    /// Active timeout in seconds
    #[clap(long, default_value_t = 1800)]
    pub active: u64,

    /// Idle timeout in seconds
    #[clap(long, default_value_t = 300)]
    pub idle: u64,

    /// Number of parallel flow table shards
    #[clap(short = 'n', long = "shards", default_value_t = 4)]
    pub shards: usize,

    /// Maximum packet size in bytes; larger packets are skipped
    #[clap(long = "size", default_value_t = 9000)]
    pub max_packet: u32,

    /// IPFIX transport protocol (udp or tcp)
    #[clap(long, default_value = "udp")]
    pub protocol: String,

    /// IPFIX observation domain
    #[clap(long, default_value_t = 1)]
    pub domain: u32,

    /// IPFIX template resend interval in seconds
    #[clap(long = "template-interval", default_value_t = 300)]
    pub template_interval: u64,

    /// IPFIX maximum message size
    #[clap(long, default_value_t = 1472)]
    pub mtu: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// One name=value line per flow
    Text,

    /// Comma-separated rows with a header
    Csv,

    /// MessagePack arrays
    Msgpack,

    /// IPFIX message stream over UDP or TCP
    #[value(name = "ipfix_stream")]
    IpfixStream,
}
