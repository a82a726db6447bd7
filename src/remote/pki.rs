//! Local key generation and certificate inspection.

use chrono::{DateTime, Utc};
use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Name, X509NameBuilder, X509ReqBuilder, X509};

use crate::api::{Csr, CsrParams, DfspJws, Subject};
use crate::commons::error::Error;

pub const DEFAULT_KEY_BITS: u32 = 4096;

fn generate_key(bits: u32) -> Result<PKey<Private>, Error> {
    let rsa = Rsa::generate(bits)?;
    Ok(PKey::from_rsa(rsa)?)
}

fn pem_string(bytes: Vec<u8>) -> Result<String, Error> {
    String::from_utf8(bytes).map_err(|e| Error::SignerError(e.to_string()))
}

fn subject_name(subject: &Subject) -> Result<X509Name, Error> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, &subject.common_name)?;

    let optional = [
        (Nid::ORGANIZATIONNAME, &subject.organization),
        (Nid::ORGANIZATIONALUNITNAME, &subject.organizational_unit),
        (Nid::LOCALITYNAME, &subject.locality),
        (Nid::STATEORPROVINCENAME, &subject.province),
        (Nid::COUNTRYNAME, &subject.country),
        (Nid::PKCS9_EMAILADDRESS, &subject.email_address),
    ];
    for (nid, value) in optional {
        if let Some(value) = value {
            name.append_entry_by_nid(nid, value)?;
        }
    }
    Ok(name.build())
}

/// Generates an RSA key and a certificate signing request for it.
pub fn create_csr(params: &CsrParams, key_bits: u32) -> Result<Csr, Error> {
    let key = generate_key(key_bits)?;

    let mut req = X509ReqBuilder::new()?;
    req.set_version(0)?;
    let name = subject_name(&params.subject)?;
    req.set_subject_name(&name)?;
    req.set_pubkey(&key)?;

    let alt_names = &params.extensions.subject_alt_name;
    if !alt_names.dns.is_empty() || !alt_names.ips.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for dns in &alt_names.dns {
            san.dns(dns);
        }
        for ip in &alt_names.ips {
            san.ip(ip);
        }
        let extension = san.build(&req.x509v3_context(None))?;
        let mut extensions = Stack::new()?;
        extensions.push(extension)?;
        req.add_extensions(&extensions)?;
    }

    req.sign(&key, MessageDigest::sha256())?;

    Ok(Csr {
        csr: pem_string(req.build().to_pem()?)?,
        private_key: pem_string(key.private_key_to_pem_pkcs8()?)?,
    })
}

/// Generates the DFSP's JWS signing key pair.
pub fn create_jws(key_bits: u32, now: DateTime<Utc>) -> Result<DfspJws, Error> {
    let key = generate_key(key_bits)?;
    Ok(DfspJws {
        public_key: pem_string(key.public_key_to_pem()?)?,
        private_key: pem_string(key.private_key_to_pem_pkcs8()?)?,
        created_at: now.timestamp(),
    })
}

/// The end of validity of the first certificate in a PEM bundle.
pub fn not_after(pem: &str) -> Result<DateTime<Utc>, Error> {
    let cert = X509::from_pem(pem.as_bytes())?;
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(cert.not_after())?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::from_timestamp(secs, 0).ok_or_else(|| Error::SignerError(format!("invalid notAfter: {}", secs)))
}

/// A throwaway self-signed certificate valid for `days`.
#[cfg(test)]
pub fn self_signed(days: u32) -> String {
    let key = generate_key(2048).unwrap();
    let name = subject_name(&Subject::with_common_name("test")).unwrap();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(days).unwrap()).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();

    String::from_utf8(builder.build().to_pem().unwrap()).unwrap()
}

//------------ Tests ---------------------------------------------------------
