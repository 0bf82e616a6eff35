#![allow(clippy::uninlined_format_args)]

use phish_sieve::components::canonicalizer::Canonicalizer;
use phish_sieve::components::forward_unwrapper::ForwardUnwrapper;
use phish_sieve::components::message_extractor::MessageExtractor;
use phish_sieve::normalization::InvisibleNormalizer;

const SAMPLE_FORWARD: &str = "From: Alice <alice@home.example>\r\n\
To: scan@phish-sieve.example\r\n\
Subject: Fwd: Urgent: verify your account\r\n\
Message-ID: <sample-forward@home.example>\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Can you check this one?\r\n\
\r\n\
---------- Forwarded message ---------\r\n\
From: Security Team <security@paypa1-support.example>\r\n\
Date: Mon, 6 Jan 2025 09:12:44 +0000\r\n\
Subject: Urgent: verify your account\r\n\
To: alice@home.example\r\n\
\r\n\
Your acc\u{200B}ount has been susp\u{200D}ended. Verify your identity within 24 hours\r\n\
at https://paypa1-support.example/login?utm_source=mail&id=88231 or it will be closed.\r\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let raw = match std::env::args().nth(1) {
        Some(path) => {
            println!("Reading message from {}", path);
            std::fs::read(&path)?
        }
        None => {
            println!("No file given, using the built-in forwarded sample");
            SAMPLE_FORWARD.as_bytes().to_vec()
        }
    };

    println!("\n=== Extraction ===");
    let (parsed, extracted) = match MessageExtractor::new().extract(&raw) {
        Ok(result) => result,
        Err(e) => {
            println!("❌ Not a parseable message: {}", e);
            return Ok(());
        }
    };
    println!("✅ Subject: {}", extracted.subject);
    println!("✅ Body ({} chars)", extracted.body.chars().count());

    println!("\n=== Invisible Content ===");
    let normalizer = InvisibleNormalizer::new();
    let subject = normalizer.normalize(&extracted.subject);
    let body = normalizer.normalize(&extracted.body);
    let source = normalizer.normalize(&extracted.source);
    if source.is_obfuscated() || subject.is_obfuscated() {
        println!("⚠️  Obfuscation removed: {:?}", source.obfuscation_indicators);
    } else {
        println!("✅ No invisible characters found");
    }

    println!("\n=== Forward Unwrap ===");
    let forwarded = ForwardUnwrapper::new().unwrap(
        &subject.normalized,
        &body.normalized,
        &source.normalized,
        Some(&parsed.headers),
    );
    match &forwarded.matched_rule {
        Some(rule) => println!("✅ Matched by {}", rule),
        None => println!("❌ No forwarding banner or header block found"),
    }
    match &forwarded.sender {
        Some(sender) => println!("✅ Original sender: {}", sender),
        None => println!("❌ Original sender not found"),
    }
    println!("Original subject: {}", forwarded.subject);
    println!("Original body:\n{}", forwarded.body);

    println!("\n=== Canonical Text ===");
    let canonicalizer = Canonicalizer::new();
    println!("Subject: {}", canonicalizer.canonicalize(&forwarded.subject));
    println!("Body:    {}", canonicalizer.canonicalize(&forwarded.body));

    Ok(())
}
