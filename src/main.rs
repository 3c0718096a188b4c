use chunkxfer::blobstore::{BlobStore, split_blob_url};
use chunkxfer::config::TransferConfig;
use chunkxfer::error::BlobStoreError;
use clap::Parser;
use cli::{Args, Commands};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config = args.transfer_config();
    match args.command {
        Commands::Cp { src, dst } => copy(&src, &dst, config).await?,
        Commands::Ls { url, prefix } => {
            let store = BlobStore::from_url(&url, config).await?;
            for key in store.list(&prefix).await? {
                println!("{key}");
            }
        }
        Commands::Stat { url, key } => {
            let store = BlobStore::from_url(&url, config).await?;
            let blob = store.blob(&key);
            println!("url:      {}", blob.url());
            println!("size:     {}", blob.size().await?);
            println!("checksum: {}", blob.checksum().await?);
            match blob.get_tags().await {
                Ok(tags) => {
                    for (k, v) in tags {
                        println!("tag:      {k}={v}");
                    }
                }
                Err(BlobStoreError::Unsupported { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Rm { url, key } => {
            let store = BlobStore::from_url(&url, config).await?;
            store.blob(&key).delete().await?;
        }
    }
    Ok(())
}

async fn copy(src: &str, dst: &str, config: TransferConfig) -> anyhow::Result<()> {
    let (src_store_url, src_key) = split_blob_url(src)?;
    let (dst_store_url, dst_key) = split_blob_url(dst)?;
    let src_store = BlobStore::from_url(&src_store_url, config.clone()).await?;
    // One store for both ends lets S3 copy single-part objects server side.
    let dst_store = if src_store_url == dst_store_url {
        None
    } else {
        Some(BlobStore::from_url(&dst_store_url, config).await?)
    };
    let src_blob = src_store.blob(&src_key);
    let dst_blob = dst_store.as_ref().unwrap_or(&src_store).blob(&dst_key);
    dst_blob.copy_from(&src_blob).await?;
    info!("Copied {} to {}", src_blob.url(), dst_blob.url());
    Ok(())
}
