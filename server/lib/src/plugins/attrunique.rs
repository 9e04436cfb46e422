// Attribute uniqueness plugin. Each instance watches a set of attribute
// types and rejects any add, modify or modify-dn that would create a second
// holder of an equal value within one of its configured scopes.
//
// Instances are scoped deliberately: several instances with disjoint base
// DNs and the same monitored attributes partition uniqueness per subtree. An
// entry outside every scope of an instance is simply not checked by it -
// including an entry *moving* outside the scopes, which is an intentional
// opt out.
//
// The check is read-then-reject. It never resolves which of two values
// already in conflict is "the original"; it only prevents a second from
// being created. Concurrent adds racing on one value are serialised by the
// store's single writer, so both can not pass the probe and then commit.

use std::collections::BTreeMap;

use crate::plugins::{OpKindSet, Plugin, PluginCapability, PluginPhase};
use crate::prelude::*;
use crate::proto::{ConsistencyError, PluginError};
use crate::server::DirectoryServer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrUniqueConfig {
    pub attrs: Vec<AttrString>,
    pub scopes: Vec<Dn>,
}

pub struct AttrUnique {
    config: AttrUniqueConfig,
}

impl AttrUnique {
    pub fn new(config: AttrUniqueConfig) -> Self {
        AttrUnique { config }
    }

    pub fn config(&self) -> &AttrUniqueConfig {
        &self.config
    }

    fn violation(attr: &str, pv: &PartialValue) -> OperationError {
        OperationError::Plugin(PluginError::AttrUnique(format!(
            "duplicate value detected for {attr}: {pv}"
        )))
    }

    /// The scopes of this instance that contain the given DN. Empty means
    /// the entry is not this instance's concern.
    fn scopes_for(&self, dn: &Dn) -> Vec<&Dn> {
        self.config.scopes.iter().filter(|s| dn.is_under(s)).collect()
    }

    /// Reject when any entry other than `exclude` holds one of the asserted
    /// values within a scope.
    fn enforce(
        &self,
        server: &DirectoryServer,
        scopes: &[&Dn],
        checks: &[(AttrString, PartialValue)],
        exclude: &Dn,
    ) -> Result<(), OperationError> {
        for scope in scopes {
            for (attr, pv) in checks {
                let filt = filter!(f_eq(attr, pv.clone()));
                let hits = match server.internal_search(
                    (*scope).clone(),
                    SearchScope::Subtree,
                    filt,
                ) {
                    Ok(hits) => hits,
                    // The scope base does not exist yet, so nothing can
                    // conflict within it.
                    Err(OperationError::NoSuchEntry) => continue,
                    Err(e) => {
                        error!(?e, "internal search failure during uniqueness check");
                        return Err(e);
                    }
                };
                if let Some(conflict) = hits.iter().find(|h| h.get_dn() != exclude) {
                    warn!(
                        %attr,
                        conflicting = %conflict.get_dn(),
                        scope = %scope,
                        "uniqueness violation"
                    );
                    return Err(Self::violation(attr, pv));
                }
            }
        }
        Ok(())
    }

    /// Every (attr, value) assertion the candidate carries for our
    /// monitored attributes.
    fn cand_checks<VALID, STATE>(&self, e: &Entry<VALID, STATE>) -> Vec<(AttrString, PartialValue)> {
        self.config
            .attrs
            .iter()
            .filter_map(|a| e.get_ava_set(a).map(|vs| (a, vs)))
            .flat_map(|(a, vs)| {
                vs.to_partialvalue_iter()
                    .map(|pv| (a.clone(), pv))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

impl Plugin for AttrUnique {
    fn id(&self) -> &'static str {
        "attr_unique"
    }

    fn capabilities(&self) -> Vec<PluginCapability> {
        vec![PluginCapability::new(
            PluginPhase::PreOperation,
            OpKindSet::ADD | OpKindSet::MODIFY | OpKindSet::MODIFY_DN,
        )]
    }

    #[instrument(level = "debug", name = "attrunique_pre_add", skip_all)]
    fn pre_add(
        &self,
        server: &DirectoryServer,
        cand: &mut EntryInvalidNew,
        _ce: &AddEvent,
    ) -> Result<(), OperationError> {
        let dn = cand.get_dn().clone();
        let scopes = self.scopes_for(&dn);
        if scopes.is_empty() {
            return Ok(());
        }
        let checks = self.cand_checks(cand);
        self.enforce(server, &scopes, &checks, &dn)
    }

    #[instrument(level = "debug", name = "attrunique_pre_modify", skip_all)]
    fn pre_modify(
        &self,
        server: &DirectoryServer,
        pre: &Arc<EntrySealedCommitted>,
        cand: &mut EntryInvalidCommitted,
        _me: &ModifyEvent,
    ) -> Result<(), OperationError> {
        let dn = pre.get_dn().clone();
        let scopes = self.scopes_for(&dn);
        if scopes.is_empty() {
            return Ok(());
        }
        // Only values being introduced need checking. A replace that leaves
        // a value the entry already holds is not a conflict with itself.
        let checks: Vec<_> = self
            .cand_checks(cand)
            .into_iter()
            .filter(|(a, pv)| !pre.attribute_equality(a, pv))
            .collect();
        if checks.is_empty() {
            return Ok(());
        }
        self.enforce(server, &scopes, &checks, &dn)
    }

    #[instrument(level = "debug", name = "attrunique_pre_modify_dn", skip_all)]
    fn pre_modify_dn(
        &self,
        server: &DirectoryServer,
        pre: &Arc<EntrySealedCommitted>,
        cand: &mut EntryInvalidCommitted,
        _ev: &ModifyDnEvent,
    ) -> Result<(), OperationError> {
        // The check is against the scopes of the *new* location. A move out
        // of every configured scope opts the entry out of this instance.
        let new_dn = cand.get_dn().clone();
        let scopes = self.scopes_for(&new_dn);
        if scopes.is_empty() {
            debug!(%new_dn, "target outside configured scopes, uniqueness not checked");
            return Ok(());
        }
        let checks = self.cand_checks(cand);
        // The entry is still stored at its old DN while we probe.
        self.enforce(server, &scopes, &checks, pre.get_dn())
    }

    #[instrument(level = "debug", name = "attrunique_verify", skip_all)]
    fn verify(&self, server: &DirectoryServer) -> Vec<Result<(), ConsistencyError>> {
        let mut res = Vec::new();
        for scope in &self.config.scopes {
            for attr in &self.config.attrs {
                let holders = match server.internal_search(
                    scope.clone(),
                    SearchScope::Subtree,
                    filter!(f_pres(attr)),
                ) {
                    Ok(h) => h,
                    Err(OperationError::NoSuchEntry) => continue,
                    Err(_) => {
                        res.push(Err(ConsistencyError::QueryServerSearchFailure));
                        continue;
                    }
                };
                let mut seen: BTreeMap<String, &Dn> = BTreeMap::new();
                for holder in &holders {
                    let Some(vs) = holder.get_ava_set(attr) else {
                        continue;
                    };
                    for v in vs {
                        let key = v.idx_eq_key();
                        if let Some(first) = seen.get(key.as_str()) {
                            res.push(Err(ConsistencyError::DuplicateUniqueAttribute(
                                attr.to_string(),
                                format!("{first} and {}", holder.get_dn()),
                            )));
                        } else {
                            seen.insert(key, holder.get_dn());
                        }
                    }
                }
            }
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{setup_test_server, test_person, test_person_with_mail};

    fn unique_mail(scopes: &[&str]) -> Arc<dyn Plugin> {
        Arc::new(AttrUnique::new(AttrUniqueConfig {
            attrs: vec![AttrString::from("mail")],
            scopes: scopes.iter().map(|s| dn!(s)).collect(),
        }))
    }

    // A second entry with an equal monitored value in the same scope is a
    // constraint violation.
    #[test]
    fn test_attrunique_add_duplicate_rejected() {
        let preload = vec![test_person_with_mail("u1", "user1@example.com")];
        let create = vec![test_person_with_mail("u2", "user1@example.com")];
        run_create_test!(
            Err(OperationError::Plugin(PluginError::AttrUnique(
                "duplicate value detected".to_string()
            ))),
            preload,
            create,
            vec![unique_mail(&["dc=example,dc=com"])],
            |_: &DirectoryServer| {}
        );
    }

    // Distinct values are fine.
    #[test]
    fn test_attrunique_add_distinct_ok() {
        let preload = vec![test_person_with_mail("u1", "user1@example.com")];
        let create = vec![test_person_with_mail("u2", "user2@example.com")];
        run_create_test!(
            Ok(()),
            preload,
            create,
            vec![unique_mail(&["dc=example,dc=com"])],
            |_: &DirectoryServer| {}
        );
    }

    // The same value in a disjoint configured scope is no conflict: scoped
    // instances partition uniqueness per subtree.
    #[test]
    fn test_attrunique_disjoint_scope_allows_duplicate() {
        // Uniqueness is only enforced under ou=people. An entry elsewhere
        // may repeat the value.
        let plugin = unique_mail(&["ou=people,dc=example,dc=com"]);
        let server = setup_test_server(vec![plugin]);
        server
            .internal_add(test_person_with_mail("u1", "user1@example.com"))
            .expect("add u1");

        // Same value, different subtree: allowed.
        let other = entry_init!(
            "cn=svc1,ou=groups,dc=example,dc=com",
            (ATTR_OBJECTCLASS, Value::new_iutf8(CLASS_EXTENSIBLEOBJECT)),
            (ATTR_CN, Value::new_iutf8("svc1")),
            (ATTR_MAIL, Value::new_iutf8("user1@example.com"))
        );
        server.internal_add(other).expect("add svc1");

        // Same value, same subtree: rejected.
        let dup = test_person_with_mail("u2", "user1@example.com");
        assert_eq!(
            server.internal_add(dup),
            Err(OperationError::Plugin(PluginError::AttrUnique(
                "duplicate value detected".to_string()
            )))
        );
        server.shutdown();
    }

    // Replacing an attribute with a value the entry already holds must
    // succeed: self conflicts are not conflicts.
    #[test]
    fn test_attrunique_self_replace_ok() {
        let preload = vec![test_person_with_mail("u1", "user1@example.com")];
        run_modify_test!(
            Ok(()),
            preload,
            "uid=u1,ou=people,dc=example,dc=com",
            ModifyList::new_purge_and_set(ATTR_MAIL, Value::new_iutf8("user1@example.com")),
            vec![unique_mail(&["dc=example,dc=com"])],
            |_: &DirectoryServer| {}
        );
    }

    // Modifying onto a value held by another in-scope entry is rejected.
    #[test]
    fn test_attrunique_modify_duplicate_rejected() {
        let preload = vec![
            test_person_with_mail("u1", "user1@example.com"),
            test_person_with_mail("u2", "user2@example.com"),
        ];
        run_modify_test!(
            Err(OperationError::Plugin(PluginError::AttrUnique(
                "duplicate value detected".to_string()
            ))),
            preload,
            "uid=u2,ou=people,dc=example,dc=com",
            ModifyList::new_purge_and_set(ATTR_MAIL, Value::new_iutf8("user1@example.com")),
            vec![unique_mail(&["dc=example,dc=com"])],
            |server: &DirectoryServer| {
                // The failed operation left the entry unmodified.
                let e = server
                    .get_entry(&dn!("uid=u2,ou=people,dc=example,dc=com"))
                    .unwrap()
                    .expect("u2 missing");
                assert!(e.attribute_equality(
                    ATTR_MAIL,
                    &PartialValue::new_iutf8("user2@example.com")
                ));
            }
        );
    }

    // A move to a new superior re-evaluates the check against the new
    // location's scope.
    #[test]
    fn test_attrunique_modify_dn_checked_in_new_scope() {
        // Unique mail under ou=groups only. u1 lives under ou=people with a
        // value already used inside ou=groups.
        let plugin = unique_mail(&["ou=groups,dc=example,dc=com"]);
        let server = setup_test_server(vec![plugin]);
        let taken = entry_init!(
            "cn=svc1,ou=groups,dc=example,dc=com",
            (ATTR_OBJECTCLASS, Value::new_iutf8(CLASS_EXTENSIBLEOBJECT)),
            (ATTR_CN, Value::new_iutf8("svc1")),
            (ATTR_MAIL, Value::new_iutf8("shared@example.com"))
        );
        server.internal_add(taken).expect("add svc1");
        server
            .internal_add(test_person_with_mail("u1", "shared@example.com"))
            .expect("add u1");

        // Moving u1 into ou=groups brings it into scope and now conflicts.
        let ev = ModifyDnEvent::new_internal(
            dn!("uid=u1,ou=people,dc=example,dc=com"),
            crate::dn::Rdn::new("uid", "u1"),
            false,
            Some(dn!("ou=groups,dc=example,dc=com")),
        );
        assert_eq!(
            server.modify_dn(&ev),
            Err(OperationError::Plugin(PluginError::AttrUnique(
                "duplicate value detected".to_string()
            )))
        );
        server.shutdown();
    }

    // A move to a superior outside every configured base skips the check:
    // opting out by moving out of scope is deliberate.
    #[test]
    fn test_attrunique_modify_dn_out_of_scope_unchecked() {
        let plugin = unique_mail(&["ou=people,dc=example,dc=com"]);
        let server = setup_test_server(vec![plugin]);
        server
            .internal_add(test_person_with_mail("u1", "shared@example.com"))
            .expect("add u1");
        server
            .internal_add(test_person_with_mail("u2", "other@example.com"))
            .expect("add u2");
        // u2 leaves the scope, then takes the shared value without conflict.
        let ev = ModifyDnEvent::new_internal(
            dn!("uid=u2,ou=people,dc=example,dc=com"),
            crate::dn::Rdn::new("uid", "u2"),
            false,
            Some(dn!("ou=groups,dc=example,dc=com")),
        );
        server.modify_dn(&ev).expect("move out of scope");

        server
            .internal_modify(
                &dn!("uid=u2,ou=groups,dc=example,dc=com"),
                ModifyList::new_purge_and_set(ATTR_MAIL, Value::new_iutf8("shared@example.com")),
            )
            .expect("duplicate outside scope is not checked");
        server.shutdown();
    }

    // Two instances with disjoint scopes coexist; each rejects only within
    // its own subtree.
    #[test]
    fn test_attrunique_multiple_instances() {
        let people = unique_mail(&["ou=people,dc=example,dc=com"]);
        let groups = unique_mail(&["ou=groups,dc=example,dc=com"]);
        let server = setup_test_server(vec![people, groups]);

        server
            .internal_add(test_person_with_mail("u1", "a@example.com"))
            .expect("add u1");
        let in_groups = entry_init!(
            "cn=svc1,ou=groups,dc=example,dc=com",
            (ATTR_OBJECTCLASS, Value::new_iutf8(CLASS_EXTENSIBLEOBJECT)),
            (ATTR_CN, Value::new_iutf8("svc1")),
            (ATTR_MAIL, Value::new_iutf8("a@example.com"))
        );
        // Allowed: the conflict spans two partitions.
        server.internal_add(in_groups).expect("add svc1");

        // Each partition still rejects internal duplicates.
        assert_eq!(
            server.internal_add(test_person_with_mail("u2", "a@example.com")),
            Err(OperationError::Plugin(PluginError::AttrUnique(
                "duplicate value detected".to_string()
            )))
        );
        server.shutdown();
    }
}
