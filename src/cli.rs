use chunkxfer::config::TransferConfig;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "Chunked blob transfer between S3 and local storage")]
pub(crate) struct Args {
    /// Range reads kept in flight while fetching a remote object
    #[arg(long, env = "CHUNKXFER_READ_WINDOW", default_value_t = 2)]
    pub(crate) read_window: usize,

    /// Part uploads kept in flight while writing a remote object (0 = inline)
    #[arg(long, env = "CHUNKXFER_CONCURRENT_UPLOADS", default_value_t = 4)]
    pub(crate) concurrent_uploads: usize,

    /// Custom S3 endpoint, e.g. a local MinIO
    #[arg(long, env = "CHUNKXFER_S3_ENDPOINT")]
    pub(crate) endpoint: Option<String>,

    /// S3 region
    #[arg(long, env = "AWS_REGION")]
    pub(crate) region: Option<String>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Copy a blob, e.g. `cp ./disk.img s3://bucket/images/disk.img`
    Cp { src: String, dst: String },
    /// List keys of a store under an optional prefix
    Ls {
        url: String,
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Show size, checksum and tags of a blob
    Stat { url: String, key: String },
    /// Delete a blob
    Rm { url: String, key: String },
}

impl Args {
    pub(crate) fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            read_window: self.read_window,
            concurrent_uploads: self.concurrent_uploads,
            endpoint_url: self.endpoint.clone(),
            region: self.region.clone(),
            ..TransferConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cp_with_overrides() {
        let args = Args::try_parse_from([
            "chunkxfer",
            "--read-window",
            "8",
            "--concurrent-uploads",
            "0",
            "cp",
            "a.bin",
            "s3://bucket/a.bin",
        ])
        .unwrap();
        let config = args.transfer_config();
        assert_eq!(config.read_window, 8);
        assert_eq!(config.concurrent_uploads, 0);
        match args.command {
            Commands::Cp { src, dst } => {
                assert_eq!(src, "a.bin");
                assert_eq!(dst, "s3://bucket/a.bin");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_ls_prefix_defaults_to_empty() {
        let args = Args::try_parse_from(["chunkxfer", "ls", "s3://bucket"]).unwrap();
        assert!(matches!(args.command, Commands::Ls { ref prefix, .. } if prefix.is_empty()));
    }
}
