//! Shared helpers for the test suites: a standard single-backend server
//! with the usual suffix layout preloaded, and entry constructors for the
//! common fixtures.

#![allow(clippy::expect_used)]

use crate::be::{BackendConfig, IdxKey, MemBackend};
use crate::plugins::Plugin;
use crate::prelude::*;
use crate::schema::Schema;
use crate::server::ServerBuilder;

fn test_dn(s: &str) -> Dn {
    Dn::parse(s).expect("invalid test dn")
}

/// The index catalog the standard test backend carries.
fn test_idxkeys() -> Vec<IdxKey> {
    vec![
        IdxKey::new(ATTR_OBJECTCLASS, IndexType::Equality),
        IdxKey::new(ATTR_OBJECTCLASS, IndexType::Presence),
        IdxKey::new(ATTR_UID, IndexType::Equality),
        IdxKey::new(ATTR_MAIL, IndexType::Equality),
        IdxKey::new(ATTR_MEMBER, IndexType::Equality),
        IdxKey::new(ATTR_UNIQUEMEMBER, IndexType::Equality),
        IdxKey::new(ATTR_SEEALSO, IndexType::Equality),
        IdxKey::new(ATTR_CN, IndexType::Equality),
        IdxKey::new(ATTR_CN, IndexType::SubString),
    ]
}

/// Build a server over `dc=example,dc=com` with the given plugins and the
/// standard ou=people / ou=groups layout preloaded.
pub fn setup_test_server(plugins: Vec<Arc<dyn Plugin>>) -> DirectoryServer {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let be = Arc::new(MemBackend::new(BackendConfig::new(
        "example",
        vec![test_dn("dc=example,dc=com")],
        test_idxkeys(),
    )));

    let mut builder = ServerBuilder::new(Schema::core())
        .add_backend(be)
        .expect("failed to register backend");
    for p in plugins {
        builder = builder.register_plugin(p).expect("failed to register plugin");
    }
    let server = builder.build();

    let mut base = crate::entry::Entry::new_init(test_dn("dc=example,dc=com"));
    base.add_ava(ATTR_OBJECTCLASS, Value::new_iutf8(CLASS_DOMAIN));
    base.add_ava(ATTR_DC, Value::new_iutf8("example"));
    server.internal_add(base).expect("failed to add base entry");

    for ou in ["people", "groups"] {
        let mut e = crate::entry::Entry::new_init(test_dn(&format!("ou={ou},dc=example,dc=com")));
        e.add_ava(ATTR_OBJECTCLASS, Value::new_iutf8(CLASS_ORGANIZATIONALUNIT));
        e.add_ava(ATTR_OU, Value::new_iutf8(ou));
        server.internal_add(e).expect("failed to add ou entry");
    }

    server
}

pub fn test_person(uid: &str) -> EntryInitNew {
    let mut e = crate::entry::Entry::new_init(test_dn(&format!(
        "uid={uid},ou=people,dc=example,dc=com"
    )));
    e.add_ava(ATTR_OBJECTCLASS, Value::new_iutf8(CLASS_INETORGPERSON));
    e.add_ava(ATTR_CN, Value::new_iutf8(uid));
    e.add_ava(ATTR_SN, Value::new_iutf8("tester"));
    e.add_ava(ATTR_UID, Value::new_iutf8(uid));
    e
}

pub fn test_person_with_mail(uid: &str, mail: &str) -> EntryInitNew {
    let mut e = test_person(uid);
    e.add_ava(ATTR_MAIL, Value::new_iutf8(mail));
    e
}

/// A static group under ou=groups whose members are people by uid.
pub fn test_group(cn: &str, member_uids: &[&str]) -> EntryInitNew {
    let mut e = crate::entry::Entry::new_init(test_dn(&format!(
        "cn={cn},ou=groups,dc=example,dc=com"
    )));
    e.add_ava(ATTR_OBJECTCLASS, Value::new_iutf8(CLASS_GROUPOFNAMES));
    e.add_ava(ATTR_CN, Value::new_iutf8(cn));
    for uid in member_uids {
        e.add_ava(
            ATTR_MEMBER,
            Value::new_dn(test_dn(&format!("uid={uid},ou=people,dc=example,dc=com"))),
        );
    }
    e
}
