use clap::Args;
use serde::Deserialize;

/// S3 backend settings.
///
/// Credentials default to the AWS provider chain unless both keys are given,
/// as for R2 or MinIO.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// Bucket holding the records
    #[arg(long = "s3-bucket", env = "FILING_S3_BUCKET")]
    pub bucket: String,

    /// Key prefix prepended to every record key
    #[arg(long = "s3-prefix", default_value = "", env = "FILING_S3_PREFIX")]
    pub prefix: String,

    /// Custom endpoint for S3-compatible stores
    #[arg(long = "s3-endpoint-url", env = "FILING_S3_ENDPOINT_URL")]
    pub endpoint_url: Option<String>,

    /// Region override
    #[arg(long = "s3-region", env = "FILING_S3_REGION")]
    pub region: Option<String>,

    /// Address buckets by path instead of virtual host
    #[arg(long = "s3-force-path-style", env = "FILING_S3_FORCE_PATH_STYLE")]
    pub force_path_style: bool,

    /// Static access key ID
    #[arg(long = "s3-access-key-id", env = "FILING_S3_ACCESS_KEY_ID")]
    pub access_key_id: Option<String>,

    /// Static secret access key
    #[arg(long = "s3-secret-access-key", env = "FILING_S3_SECRET_ACCESS_KEY")]
    pub secret_access_key: Option<String>,
}
