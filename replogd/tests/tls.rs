mod common;

use common::*;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use replog::{Consistency, Error, LogOffset};
use replogd::auth::PolicyAuthorizer;
use replogd::config::ConfigFiles;
use replogd::tls::{self, TlsParams};
use std::fs;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

const POLICY: &str = "\
p, root, *, produce
p, root, *, consume
p, root, *, join
p, root, *, leave
p, root, *, replicate
";

fn leaf(
    name: &str,
    sans: Vec<String>,
    usage: ExtendedKeyUsagePurpose,
    ca: &Certificate,
    ca_key: &KeyPair,
) -> anyhow::Result<(String, String)> {
    let key = KeyPair::generate()?;
    let mut params = CertificateParams::new(sans)?;
    params.distinguished_name.push(DnType::CommonName, name);
    params.extended_key_usages = vec![usage];
    let cert = params.signed_by(&key, ca, ca_key)?;
    Ok((cert.pem(), key.serialize_pem()))
}

/// CA, server and client certificates plus the ACL, as `replogd` expects them
fn write_config(dir: &Path) -> anyhow::Result<ConfigFiles> {
    let files = ConfigFiles::in_dir(dir);

    let ca_key = KeyPair::generate()?;
    let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "replog test CA");
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let ca = ca_params.self_signed(&ca_key)?;
    fs::write(&files.ca_file, ca.pem())?;

    let (cert, key) = leaf(
        "server",
        vec!["localhost".into(), "127.0.0.1".into()],
        ExtendedKeyUsagePurpose::ServerAuth,
        &ca,
        &ca_key,
    )?;
    fs::write(&files.server_cert_file, cert)?;
    fs::write(&files.server_key_file, key)?;

    for (name, cert_file, key_file) in [
        ("root", &files.root_client_cert_file, &files.root_client_key_file),
        ("nobody", &files.nobody_client_cert_file, &files.nobody_client_key_file),
    ] {
        let (cert, key) = leaf(name, vec![], ExtendedKeyUsagePurpose::ClientAuth, &ca, &ca_key)?;
        fs::write(cert_file, cert)?;
        fs::write(key_file, key)?;
    }

    fs::write(
        &files.acl_model_file,
        "[matchers]\nm = r.sub == p.sub && r.obj == p.obj && r.act == p.act\n",
    )?;
    fs::write(&files.acl_policy_file, POLICY)?;

    Ok(files)
}

fn secure(files: &ConfigFiles) -> impl Fn(&mut replogd::Parameters) + '_ {
    move |params| {
        params.tls = Some(TlsParams::load(files).expect("valid tls config"));
        params.authorizer = Arc::new(
            PolicyAuthorizer::load(&files.acl_model_file, &files.acl_policy_file)
                .expect("valid policy"),
        );
    }
}

#[test]
fn certificate_subject_is_the_common_name() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let files = write_config(dir.path())?;

    let certs = tls::load_certs(&files.root_client_cert_file)?;
    assert_eq!(tls::subject(Some(certs.as_slice())), "root");
    assert_eq!(tls::subject(None), "");
    Ok(())
}

#[test]
fn authorized_client_can_produce_and_consume() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let files = write_config(dir.path())?;
    let server = TestNode::bootstrap_with(secure(&files))?;

    let config = tls::client_config(
        &files.ca_file,
        &files.root_client_cert_file,
        &files.root_client_key_file,
    )?;
    let mut client = replog::std::RawClient::connect_tls(&server.addr(), config)?;
    assert_eq!(client.produce(b"secret")?, LogOffset(0));
    assert_eq!(client.consume(LogOffset(0), Consistency::Strong)?, b"secret");

    Ok(())
}

#[test]
fn unauthorized_client_is_denied() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let files = write_config(dir.path())?;
    let server = TestNode::bootstrap_with(secure(&files))?;

    let config = tls::client_config(
        &files.ca_file,
        &files.nobody_client_cert_file,
        &files.nobody_client_key_file,
    )?;
    let mut client = replog::std::RawClient::connect_tls(&server.addr(), config)?;
    assert!(matches!(client.produce(b"nope"), Err(Error::Unauthorized)));
    assert!(matches!(
        client.consume(LogOffset(0), Consistency::Strong),
        Err(Error::Unauthorized)
    ));
    assert!(matches!(client.get_servers(), Err(Error::Unauthorized)));
    assert_eq!(server.ctrl().records_end(), LogOffset(0));

    Ok(())
}

#[test]
fn plain_connection_is_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let files = write_config(dir.path())?;
    let server = TestNode::bootstrap_with(secure(&files))?;

    // a plaintext client sends its request header instead of a TLS hello
    let mut stream = TcpStream::connect(server.addr())?;
    stream.set_read_timeout(Some(TIMEOUT))?;
    stream.write_all(&[0u8; 14])?;

    let mut buf = vec![];
    match stream.read_to_end(&mut buf) {
        // at most a TLS alert, never a connection hello
        Ok(_) => assert!(buf.is_empty() || buf[0] == 0x15),
        Err(e) => assert!(!matches!(
            e.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        )),
    }
    Ok(())
}

#[tokio::test]
async fn cluster_replicates_over_tls() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let files = write_config(dir.path())?;
    let config = tls::client_config(
        &files.ca_file,
        &files.root_client_cert_file,
        &files.root_client_key_file,
    )?;

    let leader = TestNode::bootstrap_with(secure(&files))?;
    let follower = TestNode::new_with(2, false, secure(&files))?;

    let mut client = replog::tokio::AsyncClient::connect_tls(&leader.addr(), config.clone()).await?;
    let start = std::time::Instant::now();
    // the leader may still be committing its first entry
    loop {
        match client.join(follower.id(), &follower.addr(), true).await {
            Ok(()) => break,
            Err(Error::Invalid(_)) if start.elapsed() < TIMEOUT => {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    let offsets = replog::tokio::AsyncClient::connect_tls(&leader.addr(), config.clone())
        .await?
        .produce_stream([b"a".to_vec(), b"b".to_vec()])
        .await?
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(offsets, [LogOffset(0), LogOffset(1)]);

    follower.wait_for_records(2)?;
    let mut follower_client =
        replog::tokio::AsyncClient::connect_tls(&follower.addr(), config).await?;
    assert_eq!(
        follower_client
            .consume(LogOffset(1), Consistency::Relaxed)
            .await?,
        b"b"
    );

    Ok(())
}
