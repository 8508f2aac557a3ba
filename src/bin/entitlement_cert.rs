use anyhow::Context;
use clap::{Parser, Subcommand};
use entitlement_pki::cache::payload_key;
use entitlement_pki::cache::LruAnonymousContentCache;
use entitlement_pki::content::ContentPathBuilder;
use entitlement_pki::pki::oid::{self, Oid};
use entitlement_pki::pki::{
    huffman, ExtensionValue, InMemoryKeyPairProvider, LocalCertificateAuthority, PayloadBlock,
};
use entitlement_pki::storage::InMemoryDirectory;
use entitlement_pki::types::*;
use entitlement_pki::{CertificateLifecycleManager, CertificateRole, Collaborators, Config};
use chrono::{Duration, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use x509_parser::pem::parse_x509_pem;

#[derive(Parser)]
#[command(name = "entitlement-cert")]
#[command(about = "Inspect entitlement certificates and content path resolution")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML), overridable with ENTITLEMENT__* variables
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print subject, validity, entitlement extensions and payload of a certificate
    CatCert {
        /// PEM file, optionally followed by entitlement data
        path: PathBuf,
        /// Skip the payload body
        #[arg(long)]
        no_payload: bool,
    },
    /// Resolve content URLs against an owner prefix
    ContentPaths {
        /// Owner prefix, may contain $env
        #[arg(long)]
        prefix: Option<String>,
        /// Name of the winning environment
        #[arg(long)]
        environment: Option<String>,
        urls: Vec<String>,
    },
    /// Compute the content access payload key for a consumer view
    PayloadKey {
        #[arg(long = "arch")]
        arches: Vec<String>,
        /// Environment ids in priority order
        #[arg(long = "env")]
        environments: Vec<String>,
    },
    /// Issue a sample entitlement certificate from an in-memory directory
    Sample {
        /// Number of content sets on the sample product
        #[arg(long, default_value_t = 3)]
        content: u32,
        /// Issue for a consumer that only reads legacy certificates
        #[arg(long)]
        legacy: bool,
    },
}

fn cat_cert(path: &PathBuf, no_payload: bool) -> anyhow::Result<()> {
    let artifact = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let (_, pem) = parse_x509_pem(artifact.as_bytes()).context("no PEM certificate found")?;
    let cert = pem.parse_x509().context("invalid X.509 certificate")?;

    println!("Subject:    {}", cert.subject());
    println!("Issuer:     {}", cert.issuer());
    println!("Serial:     {}", cert.serial);
    println!("Not before: {}", cert.validity().not_before);
    println!("Not after:  {}", cert.validity().not_after);

    let redhat = Oid::redhat(&[]);
    let data_oid = Oid::redhat(&[oid::ENTITLEMENT_DATA]).to_string();
    for extension in cert.extensions() {
        let id = extension.oid.to_id_string();
        let Ok(parsed) = id.parse::<Oid>() else {
            continue;
        };
        if !parsed.starts_with(&redhat) {
            continue;
        }
        match ExtensionValue::from_der(extension.value)? {
            ExtensionValue::Text(text) => println!("{}: {}", id, text),
            ExtensionValue::Bytes(bytes) if id == data_oid => {
                let paths = huffman::decode_paths(&bytes)?;
                println!("{}: {} content paths ({} bytes)", id, paths.len(), bytes.len());
                for path in paths {
                    println!("    {}", path);
                }
            }
            ExtensionValue::Bytes(bytes) => println!("{}: {}", id, hex::encode(bytes)),
        }
    }

    if no_payload {
        return Ok(());
    }
    match PayloadBlock::parse(&artifact)? {
        Some(block) => {
            println!("Signature:  {} ({} bytes)", block.scheme, block.signature.len());
            let json: serde_json::Value = serde_json::from_slice(&block.json)?;
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        None => debug!("{} carries no entitlement data", path.display()),
    }
    Ok(())
}

fn sample(config: Config, content_count: u32, legacy: bool) -> anyhow::Result<()> {
    let signer = Arc::new(LocalCertificateAuthority::generate(
        &config.ca,
        config.certificates.key_algorithm,
    )?);
    let keys = Arc::new(InMemoryKeyPairProvider::new(config.certificates.key_algorithm));
    let directory = Arc::new(InMemoryDirectory::new());
    let anonymous = Arc::new(LruAnonymousContentCache::from_config(&config.cache)?);

    directory.add_owner(Owner::new("sample-owner", "sample"));
    let mut consumer = Consumer::new("sample-consumer", "sample-box", "sample-owner", ConsumerType::System);
    if !legacy {
        consumer
            .facts
            .insert(facts::CERTIFICATE_VERSION.to_string(), "3.4".to_string());
    }
    directory.add_consumer(consumer);

    let mut product = Product::new("100", "Sample OS").with_attribute(attributes::VERSION, "1.0");
    for i in 0..content_count {
        let id = (1000 + i).to_string();
        product = product.with_content(
            Content::new(id.as_str(), format!("sample-{}", id), format!("/content/dist/sample/{}", id)),
            i % 2 == 0,
        );
    }
    let mut sku = Product::new("MKT-SAMPLE", "Sample Subscription");
    sku.provided_products.push(product);

    directory.add_pool(Pool {
        id: "sample-pool".to_string(),
        owner_id: "sample-owner".to_string(),
        product: sku,
        quantity: 10,
        start_date: Utc::now() - Duration::days(1),
        end_date: Utc::now() + Duration::days(365),
        order_number: Some("sample-order".to_string()),
        contract_number: None,
        account_number: None,
        attributes: BTreeMap::new(),
    });
    directory.add_entitlement(Entitlement {
        id: "sample-entitlement".to_string(),
        consumer_id: "sample-consumer".to_string(),
        pool_id: "sample-pool".to_string(),
        quantity: 1,
        dirty: false,
    });

    let stores = Collaborators::in_memory(directory, signer, keys);
    let manager = CertificateLifecycleManager::new(config, stores, anonymous);
    let cert = manager
        .generate(&CertificateRole::entitlement("sample-entitlement"))?
        .context("no certificate issued")?;
    info!("Issued sample certificate with serial {}", cert.serial.id);
    print!("{}", cert.artifact());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::CatCert { path, no_payload } => cat_cert(&path, no_payload)?,
        Commands::ContentPaths {
            prefix,
            environment,
            urls,
        } => {
            let builder = ContentPathBuilder::new(
                prefix
                    .as_deref()
                    .or(config.content.default_content_prefix.as_deref()),
            );
            let environment = environment.map(|name| Environment::new(name.as_str(), "cli", name.as_str()));
            for url in urls {
                println!("{}", builder.build(environment.as_ref(), &url));
            }
        }
        Commands::PayloadKey {
            arches,
            environments,
        } => {
            println!(
                "{}",
                payload_key(config.cache.payload_key_version, &arches, &environments)
            );
        }
        Commands::Sample { content, legacy } => sample(config, content, legacy)?,
    }

    Ok(())
}
