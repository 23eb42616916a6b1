//! Credential resolution for the control-plane client. Grounded on
//! `loadKubeAPIConfig`/`loadInClusterConfig`/`loadLocalConfig` in
//! `client_config.go`: try in-cluster (service-account token + CA mounted
//! by the kubelet), and fall back to a kubeconfig file otherwise.

use std::path::{Path, PathBuf};

use base64::Engine;
use serde::Deserialize;
use snafu::Snafu;

const IN_CLUSTER_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const IN_CLUSTER_CA_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// TLS material resolved from either a file path or inline base64, per the
/// kubeconfig spec.
#[derive(Debug, Clone, Default)]
pub struct TlsMaterial {
    pub ca: Option<Vec<u8>>,
    pub client_cert: Option<Vec<u8>>,
    pub client_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub server: String,
    pub bearer_token: Option<String>,
    pub tls: TlsMaterial,
}

#[derive(Debug, Snafu)]
pub enum AuthError {
    #[snafu(display(
        "cannot load discovery config from in-cluster config: {in_cluster}; and from local config: {local}"
    ))]
    NoConfig { in_cluster: String, local: String },
}

/// Resolve credentials: in-cluster first, kubeconfig as fallback. Returns
/// the resolved config plus whether it came from a local kubeconfig (versus
/// in-cluster), which callers may want for logging.
pub async fn load_kube_api_config(
    kubeconfig_override: Option<PathBuf>,
) -> Result<(ApiConfig, bool), AuthError> {
    match load_in_cluster_config().await {
        Ok(cfg) => return Ok((cfg, false)),
        Err(in_cluster_err) => match load_local_config(kubeconfig_override).await {
            Ok(cfg) => Ok((cfg, true)),
            Err(local_err) => Err(AuthError::NoConfig {
                in_cluster: in_cluster_err,
                local: local_err,
            }),
        },
    }
}

async fn load_in_cluster_config() -> Result<ApiConfig, String> {
    let host = std::env::var("KUBERNETES_SERVICE_HOST")
        .map_err(|_| "KUBERNETES_SERVICE_HOST is not set".to_string())?;
    let port = std::env::var("KUBERNETES_SERVICE_PORT")
        .map_err(|_| "KUBERNETES_SERVICE_PORT is not set".to_string())?;
    if host.is_empty() || port.is_empty() {
        return Err("KUBERNETES_SERVICE_HOST/KUBERNETES_SERVICE_PORT are empty".to_string());
    }

    let token = tokio::fs::read_to_string(IN_CLUSTER_TOKEN_FILE)
        .await
        .map_err(|error| format!("cannot read service account token: {error}"))?;
    let ca = tokio::fs::read(IN_CLUSTER_CA_FILE)
        .await
        .map_err(|error| format!("cannot read service account CA: {error}"))?;

    let server = format!("https://{}", join_host_port(&host, &port));
    Ok(ApiConfig {
        server,
        bearer_token: Some(token.trim().to_string()),
        tls: TlsMaterial {
            ca: Some(ca),
            client_cert: None,
            client_key: None,
        },
    })
}

fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[derive(Debug, Deserialize, Default)]
struct KubeConfig {
    #[serde(default)]
    clusters: Vec<KubeConfigCluster>,
    #[serde(default)]
    users: Vec<KubeConfigUser>,
    #[serde(default)]
    contexts: Vec<KubeConfigContext>,
    #[serde(rename = "current-context", default)]
    current_context: String,
}

#[derive(Debug, Deserialize)]
struct KubeConfigCluster {
    name: String,
    cluster: KubeConfigClusterInner,
}

#[derive(Debug, Deserialize, Default)]
struct KubeConfigClusterInner {
    #[serde(default)]
    server: String,
    #[serde(rename = "certificate-authority", default)]
    certificate_authority: String,
    #[serde(rename = "certificate-authority-data", default)]
    certificate_authority_data: String,
}

#[derive(Debug, Deserialize)]
struct KubeConfigUser {
    name: String,
    user: KubeConfigUserInner,
}

#[derive(Debug, Deserialize, Default)]
struct KubeConfigUserInner {
    #[serde(default)]
    token: String,
    #[serde(rename = "client-certificate", default)]
    client_certificate: String,
    #[serde(rename = "client-certificate-data", default)]
    client_certificate_data: String,
    #[serde(rename = "client-key", default)]
    client_key: String,
    #[serde(rename = "client-key-data", default)]
    client_key_data: String,
}

#[derive(Debug, Deserialize)]
struct KubeConfigContext {
    name: String,
    context: KubeConfigContextInner,
}

#[derive(Debug, Deserialize, Default)]
struct KubeConfigContextInner {
    #[serde(default)]
    cluster: String,
    #[serde(default)]
    user: String,
}

async fn load_local_config(kubeconfig_override: Option<PathBuf>) -> Result<ApiConfig, String> {
    let config_path = kubeconfig_override.unwrap_or_else(default_kubeconfig_path);

    let raw = tokio::fs::read_to_string(&config_path)
        .await
        .map_err(|error| format!("cannot read {}: {error}", config_path.display()))?;
    let cfg: KubeConfig = serde_yaml::from_str(&raw)
        .map_err(|error| format!("cannot parse yaml {}: {error}", config_path.display()))?;

    let ctx = cfg
        .contexts
        .iter()
        .find(|c| c.name == cfg.current_context)
        .ok_or_else(|| {
            format!(
                "cannot find current context {:?} in {}",
                cfg.current_context,
                config_path.display()
            )
        })?;

    let cluster = cfg
        .clusters
        .iter()
        .find(|c| c.name == ctx.context.cluster)
        .ok_or_else(|| {
            format!(
                "cannot find cluster {:?} in {}",
                ctx.context.cluster,
                config_path.display()
            )
        })?;

    let mut tls = TlsMaterial::default();
    if !cluster.cluster.certificate_authority.is_empty() {
        tls.ca = Some(
            read_material(&cluster.cluster.certificate_authority, &config_path)
                .await
                .map_err(|e| e.to_string())?,
        );
    } else if !cluster.cluster.certificate_authority_data.is_empty() {
        tls.ca = Some(decode_base64(&cluster.cluster.certificate_authority_data, "CA certificate")?);
    }

    let user = cfg
        .users
        .iter()
        .find(|u| u.name == ctx.context.user)
        .ok_or_else(|| {
            format!(
                "cannot find current user {:?} in {}",
                ctx.context.user,
                config_path.display()
            )
        })?;

    if !user.user.client_certificate.is_empty() {
        tls.client_cert = Some(
            read_material(&user.user.client_certificate, &config_path)
                .await
                .map_err(|e| e.to_string())?,
        );
    } else if !user.user.client_certificate_data.is_empty() {
        tls.client_cert = Some(decode_base64(
            &user.user.client_certificate_data,
            "client certificate",
        )?);
    }

    if !user.user.client_key.is_empty() {
        tls.client_key = Some(
            read_material(&user.user.client_key, &config_path)
                .await
                .map_err(|e| e.to_string())?,
        );
    } else if !user.user.client_key_data.is_empty() {
        tls.client_key = Some(decode_base64(&user.user.client_key_data, "client key")?);
    }

    let bearer_token = if user.user.token.is_empty() {
        None
    } else {
        Some(user.user.token.clone())
    };

    Ok(ApiConfig {
        server: cluster.cluster.server.clone(),
        bearer_token,
        tls,
    })
}

fn default_kubeconfig_path() -> PathBuf {
    if let Ok(path) = std::env::var("KUBECONFIG") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_default();
    Path::new(&home).join(".kube").join("config")
}

async fn read_material(path: &str, kubeconfig_path: &Path) -> Result<Vec<u8>, String> {
    tokio::fs::read(path).await.map_err(|error| {
        format!(
            "cannot read {path} referenced from {}: {error}",
            kubeconfig_path.display()
        )
    })
}

fn decode_base64(data: &str, what: &str) -> Result<Vec<u8>, String> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|error| format!("cannot decode base64 encoded {what} data: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_local_config_with_inline_base64_tls_material() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubeconfig");

        let ca = base64::engine::general_purpose::STANDARD.encode(b"fake-ca");
        let cert = base64::engine::general_purpose::STANDARD.encode(b"fake-cert");
        let key = base64::engine::general_purpose::STANDARD.encode(b"fake-key");

        let contents = format!(
            "current-context: default\n\
clusters:\n\
- name: c\n\
  cluster:\n\
    server: https://example.invalid:6443\n\
    certificate-authority-data: {ca}\n\
users:\n\
- name: u\n\
  user:\n\
    client-certificate-data: {cert}\n\
    client-key-data: {key}\n\
contexts:\n\
- name: default\n\
  context:\n\
    cluster: c\n\
    user: u\n"
        );
        tokio::fs::write(&path, contents).await.unwrap();

        let cfg = load_local_config(Some(path)).await.unwrap();
        assert_eq!(cfg.server, "https://example.invalid:6443");
        assert_eq!(cfg.tls.ca.as_deref(), Some(&b"fake-ca"[..]));
        assert_eq!(cfg.tls.client_cert.as_deref(), Some(&b"fake-cert"[..]));
        assert_eq!(cfg.tls.client_key.as_deref(), Some(&b"fake-key"[..]));
        assert_eq!(cfg.bearer_token, None);
    }

    #[test]
    fn join_host_port_brackets_ipv6() {
        assert_eq!(join_host_port("10.0.0.1", "443"), "10.0.0.1:443");
        assert_eq!(join_host_port("::1", "443"), "[::1]:443");
    }
}
