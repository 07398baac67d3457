use anyhow::{Context, Result, bail};
use deadpool_postgres::{
    Config as PgConfig, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime,
};
use rustls::pki_types::CertificateDer;
use tokio_postgres::NoTls;

use crate::args::PostgresArgs;

/// Build the connection pool for the job store.
///
/// TLS engages only when a CA bundle is configured; the bundle is decoded
/// straight from the argument value. The password falls back to the
/// POSTGRES_PASSWORD environment variable so it can be injected as a secret
/// without appearing on the command line.
pub fn create_pool(args: PostgresArgs) -> Result<Pool> {
    let mut cfg = PgConfig::new();
    cfg.host = Some(args.postgres_host);
    cfg.port = Some(args.postgres_port);
    cfg.dbname = Some(args.postgres_database);
    cfg.user = Some(args.postgres_username);
    cfg.password = args
        .postgres_password
        .or_else(|| std::env::var("POSTGRES_PASSWORD").ok());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(PoolConfig::new(args.postgres_pool_size));

    let pool = match args.postgres_ca_cert {
        Some(pem) => {
            let roots = decode_cert_bundle(pem.as_bytes())
                .context("failed to parse POSTGRES_CA_CERT")?;
            let tls = crate::make_rustls(roots).context("failed to build TLS connector")?;
            cfg.create_pool(Some(Runtime::Tokio1), tls)
        }
        None => cfg.create_pool(Some(Runtime::Tokio1), NoTls),
    }
    .context("failed to create Postgres pool")?;

    Ok(pool)
}

/// Accepts either a PEM bundle or a single raw DER certificate.
fn decode_cert_bundle(bytes: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    if !bytes.starts_with(b"-----BEGIN") {
        return Ok(vec![CertificateDer::from(bytes.to_vec())]);
    }

    let mut reader: &[u8] = bytes;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<_>>()
        .context("failed to read PEM bundle")?;
    if certs.is_empty() {
        bail!("no X509 certificates found in provided PEM");
    }
    Ok(certs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_der_bytes_pass_through_as_one_cert() {
        let certs = decode_cert_bundle(&[0x30, 0x82, 0x01, 0x0a]).unwrap();
        assert_eq!(certs.len(), 1);
    }

    #[test]
    fn empty_pem_bundle_is_rejected() {
        assert!(decode_cert_bundle(b"-----BEGIN CERTIFICATE-----\n").is_err());
    }
}
