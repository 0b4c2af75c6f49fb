//! Region codes and the API domains they resolve to

/// AWS-style region code to Genesys Cloud domain
const REGIONS: &[(&str, &str)] = &[
    ("dca", "inindca.com"),
    ("tca", "inintca.com"),
    ("us-east-1", "mypurecloud.com"),
    ("us-east-2", "use2.us-gov-pure.cloud"),
    ("us-west-2", "usw2.pure.cloud"),
    ("eu-west-1", "mypurecloud.ie"),
    ("eu-west-2", "euw2.pure.cloud"),
    ("ap-southeast-2", "mypurecloud.com.au"),
    ("ap-northeast-1", "mypurecloud.jp"),
    ("eu-central-1", "mypurecloud.de"),
    ("ca-central-1", "cac1.pure.cloud"),
    ("ap-northeast-2", "apne2.pure.cloud"),
    ("ap-south-1", "aps1.pure.cloud"),
    ("sa-east-1", "sae1.pure.cloud"),
    ("ap-northeast-3", "apne3.pure.cloud"),
    ("eu-central-2", "euc2.pure.cloud"),
    ("me-central-1", "mec1.pure.cloud"),
    ("mx-central-1", "mxc1.pure.cloud"),
    ("ap-southeast-1", "apse1.pure.cloud"),
];

pub const DEFAULT_REGION: &str = "us-east-1";

/// Domain for a region code (case-insensitive)
pub fn domain(region: &str) -> Option<&'static str> {
    let region = region.to_ascii_lowercase();
    REGIONS
        .iter()
        .find(|(code, _)| *code == region)
        .map(|(_, domain)| *domain)
}

pub fn allowed_regions() -> Vec<&'static str> {
    REGIONS.iter().map(|(code, _)| *code).collect()
}

/// API base path, e.g. `https://api.mypurecloud.com`
pub fn base_path(region: &str) -> Option<String> {
    domain(region).map(|d| format!("https://api.{}", d))
}

/// OAuth login base path, e.g. `https://login.mypurecloud.com`
pub fn login_path(region: &str) -> Option<String> {
    domain(region).map(|d| format!("https://login.{}", d))
}
