use clap::Parser;

/// Define CLI arguments
#[derive(Parser)]
#[command(
    version,
    about = "Real-time media relay",
    long_about = "A real-time media relay: ingests live audio/video streams from\n\
                  RTSP, RTMP, SRT and WebRTC publishers and re-emits them to any\n\
                  number of concurrent readers, with optional on-disk recording.\n\
                  \n\
                  The relay does not transcode; it fans out packetized media at\n\
                  wire speed."
)]
pub struct CliArgs {
    /// RTSP listen address
    #[arg(long, default_value = ":8554", help = "Address of the RTSP front end")]
    pub rtsp_address: String,

    /// Socket read timeout in seconds
    #[arg(long, default_value_t = 10.0, help = "Read timeout of wire sockets, in seconds")]
    pub read_timeout: f64,

    /// Socket write timeout in seconds
    #[arg(long, default_value_t = 10.0, help = "Write timeout of wire sockets, in seconds")]
    pub write_timeout: f64,

    /// Size of each reader's write queue
    #[arg(
        long,
        default_value_t = 512,
        help = "Units buffered per reader before the reader is considered too slow and dropped"
    )]
    pub write_queue_size: usize,

    /// Maximum size of outgoing UDP/RTP payloads
    #[arg(
        long,
        default_value_t = 1472,
        help = "RTP packets above this size are re-packetized"
    )]
    pub udp_max_payload_size: usize,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable detailed debug logging")]
    pub verbose: bool,
}
