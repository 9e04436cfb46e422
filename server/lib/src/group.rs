//! Group and membership evaluation. Groups are directory entries matching
//! the group definition classes: static groups hold explicit member DNs,
//! dynamic groups hold a filter and base that select their members.
//! Membership queries are always point in time - every call re-resolves
//! against current directory state, and nothing here caches across calls.

use std::collections::BTreeSet;

use crate::prelude::*;
use crate::server::DirectoryServer;

lazy_static! {
    static ref PV_GROUPOFNAMES: PartialValue = PartialValue::new_iutf8(CLASS_GROUPOFNAMES);
    static ref PV_GROUPOFURLS: PartialValue = PartialValue::new_iutf8(CLASS_GROUPOFURLS);
}

#[derive(Debug, Clone)]
enum GroupKind {
    Static { members: Vec<Dn> },
    Dynamic { base: Dn, query: String },
}

#[derive(Debug, Clone)]
pub struct Group {
    dn: Dn,
    kind: GroupKind,
}

impl Group {
    /// Construct from a directory entry matching the group definition
    /// filter. Entries that are not groups are an error.
    pub fn try_from_entry(entry: &EntrySealedCommitted) -> Result<Self, OperationError> {
        let dn = entry.get_dn().clone();
        if entry.attribute_equality(ATTR_OBJECTCLASS, &PV_GROUPOFNAMES) {
            let members = [ATTR_MEMBER, ATTR_UNIQUEMEMBER]
                .iter()
                .filter_map(|a| entry.get_ava_set(a))
                .flat_map(|vs| vs.as_dn_iter().cloned())
                .collect();
            Ok(Group {
                dn,
                kind: GroupKind::Static { members },
            })
        } else if entry.attribute_equality(ATTR_OBJECTCLASS, &PV_GROUPOFURLS) {
            let base = entry
                .get_ava_single_dn(ATTR_MEMBERQUERYBASE)
                .cloned()
                .ok_or(OperationError::InvalidEntryState)?;
            let query = entry
                .get_ava_single_utf8(ATTR_MEMBERQUERY)
                .map(str::to_string)
                .ok_or(OperationError::InvalidEntryState)?;
            Ok(Group {
                dn,
                kind: GroupKind::Dynamic { base, query },
            })
        } else {
            Err(OperationError::InvalidEntryState)
        }
    }

    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    /// Static groups may nest other groups through their member values;
    /// dynamic membership is flat.
    pub fn supports_nested_groups(&self) -> bool {
        matches!(self.kind, GroupKind::Static { .. })
    }
}

/// Stateless membership resolution over a server. Holds no caches by
/// design: the answer reflects the directory at the moment of the call.
pub struct GroupEvaluator<'a> {
    server: &'a DirectoryServer,
}

impl<'a> GroupEvaluator<'a> {
    pub fn new(server: &'a DirectoryServer) -> Self {
        GroupEvaluator { server }
    }

    fn load_group(&self, dn: &Dn) -> Result<Option<Group>, OperationError> {
        let Some(entry) = self.server.get_entry(dn)? else {
            return Ok(None);
        };
        // A member value pointing at a non-group entry is simply not a
        // group - it does not expand further.
        Ok(Group::try_from_entry(&entry).ok())
    }

    pub fn is_member(&self, group_dn: &Dn, candidate: &Dn) -> Result<bool, OperationError> {
        let mut visited = BTreeSet::new();
        self.is_member_inner(group_dn, candidate, &mut visited)
    }

    fn is_member_inner(
        &self,
        group_dn: &Dn,
        candidate: &Dn,
        visited: &mut BTreeSet<Dn>,
    ) -> Result<bool, OperationError> {
        if !visited.insert(group_dn.clone()) {
            // Already expanded in this resolution: a cycle. Truncate rather
            // than fail.
            trace!(%group_dn, "nested group cycle truncated");
            return Ok(false);
        }
        let Some(group) = self.load_group(group_dn)? else {
            return Ok(false);
        };
        match &group.kind {
            GroupKind::Static { members } => {
                if members.iter().any(|m| m == candidate) {
                    return Ok(true);
                }
                for m in members {
                    if self.is_member_inner(m, candidate, visited)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            GroupKind::Dynamic { base, query } => {
                if !candidate.is_under(base) {
                    return Ok(false);
                }
                let Some(entry) = self.server.get_entry(candidate)? else {
                    return Ok(false);
                };
                let schema = self.server.schema().read();
                let filter = Filter::parse(&schema, query)?
                    .validate(&schema)
                    .map_err(OperationError::SchemaViolation)?;
                Ok(entry.entry_match_no_index(&filter))
            }
        }
    }

    /// Membership check against an entry already in hand. Dynamic groups
    /// evaluate the given entry directly; static groups resolve by its DN.
    pub fn is_member_entry(
        &self,
        group_dn: &Dn,
        entry: &EntrySealedCommitted,
    ) -> Result<bool, OperationError> {
        let Some(group) = self.load_group(group_dn)? else {
            return Ok(false);
        };
        match &group.kind {
            GroupKind::Static { .. } => self.is_member(group_dn, entry.get_dn()),
            GroupKind::Dynamic { base, query } => {
                if !entry.get_dn().is_under(base) {
                    return Ok(false);
                }
                let schema = self.server.schema().read();
                let filter = Filter::parse(&schema, query)?
                    .validate(&schema)
                    .map_err(OperationError::SchemaViolation)?;
                Ok(entry.entry_match_no_index(&filter))
            }
        }
    }

    /// Member entries restricted to a base, scope and optional filter - the
    /// narrowed membership listing access evaluation uses.
    pub fn members_within(
        &self,
        group_dn: &Dn,
        base: &Dn,
        scope: SearchScope,
        filter: Option<&Filter<FilterInvalid>>,
    ) -> Result<Members, OperationError> {
        let restriction = match filter {
            Some(f) => {
                let schema = self.server.schema().read();
                Some(
                    f.validate(&schema)
                        .map_err(OperationError::SchemaViolation)?,
                )
            }
            None => None,
        };
        let keep = |e: &Arc<EntrySealedCommitted>| -> bool {
            let dn = e.get_dn();
            let in_scope = match scope {
                SearchScope::Base => dn == base,
                SearchScope::OneLevel => dn.parent().as_ref() == Some(base),
                SearchScope::Subtree => dn.is_under(base),
            };
            in_scope
                && restriction
                    .as_ref()
                    .map(|f| e.entry_match_no_index(f))
                    .unwrap_or(true)
        };
        let all = self.members(group_dn)?;
        let filtered: Vec<_> = all.filter(keep).collect();
        Ok(Members {
            inner: filtered.into_iter(),
        })
    }

    /// Resolve the member entries of a group, expanding nested static
    /// groups. The iterator is finite and not restartable; a fresh call
    /// re-executes the underlying searches.
    pub fn members(&self, group_dn: &Dn) -> Result<Members, OperationError> {
        let mut visited = BTreeSet::new();
        let mut out: Vec<Arc<EntrySealedCommitted>> = Vec::new();
        let mut seen_members: BTreeSet<Dn> = BTreeSet::new();
        self.collect_members(group_dn, &mut visited, &mut seen_members, &mut out)?;
        Ok(Members {
            inner: out.into_iter(),
        })
    }

    fn collect_members(
        &self,
        group_dn: &Dn,
        visited: &mut BTreeSet<Dn>,
        seen: &mut BTreeSet<Dn>,
        out: &mut Vec<Arc<EntrySealedCommitted>>,
    ) -> Result<(), OperationError> {
        if !visited.insert(group_dn.clone()) {
            return Ok(());
        }
        let Some(group) = self.load_group(group_dn)? else {
            return Ok(());
        };
        match &group.kind {
            GroupKind::Static { members } => {
                for m in members {
                    let Some(entry) = self.server.get_entry(m)? else {
                        // A dangling reference contributes nothing.
                        continue;
                    };
                    if Group::try_from_entry(&entry).is_ok() {
                        self.collect_members(m, visited, seen, out)?;
                    } else if seen.insert(m.clone()) {
                        out.push(entry);
                    }
                }
            }
            GroupKind::Dynamic { base, query } => {
                let schema = self.server.schema().read();
                let filter = Filter::parse(&schema, query)?;
                drop(schema);
                let matched = match self.server.internal_search(
                    base.clone(),
                    SearchScope::Subtree,
                    filter,
                ) {
                    Ok(m) => m,
                    Err(OperationError::NoSuchEntry) => Vec::new(),
                    Err(e) => return Err(e),
                };
                for entry in matched {
                    if entry.get_dn() == group_dn {
                        continue;
                    }
                    if seen.insert(entry.get_dn().clone()) {
                        out.push(entry);
                    }
                }
            }
        }
        Ok(())
    }
}

/// A finite, point-in-time member listing.
pub struct Members {
    inner: std::vec::IntoIter<Arc<EntrySealedCommitted>>,
}

impl Iterator for Members {
    type Item = Arc<EntrySealedCommitted>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::refint::{RefintConfig, ReferentialIntegrity};
    use crate::plugins::Plugin;
    use crate::testkit::{setup_test_server, test_group, test_person};

    fn group_with_members(cn: &str, members: &[&str]) -> EntryInitNew {
        // Members given as full DNs.
        let mut e = crate::entry::Entry::new_init(dn!(&format!(
            "cn={cn},ou=groups,dc=example,dc=com"
        )));
        e.add_ava(ATTR_OBJECTCLASS, Value::new_iutf8(CLASS_GROUPOFNAMES));
        e.add_ava(ATTR_CN, Value::new_iutf8(cn));
        for m in members {
            e.add_ava(ATTR_MEMBER, Value::new_dn(dn!(m)));
        }
        e
    }

    #[test]
    fn test_group_static_membership() {
        let server = setup_test_server(vec![]);
        server.internal_add(test_person("u1")).expect("add");
        server.internal_add(test_person("u2")).expect("add");
        server
            .internal_add(test_group("g1", &["u1"]))
            .expect("add group");

        let ev = GroupEvaluator::new(&server);
        let g1 = dn!("cn=g1,ou=groups,dc=example,dc=com");
        assert!(ev
            .is_member(&g1, &dn!("uid=u1,ou=people,dc=example,dc=com"))
            .unwrap());
        assert!(!ev
            .is_member(&g1, &dn!("uid=u2,ou=people,dc=example,dc=com"))
            .unwrap());

        let members: Vec<String> = ev
            .members(&g1)
            .unwrap()
            .map(|e| e.get_dn().to_string())
            .collect();
        assert_eq!(members, vec!["uid=u1,ou=people,dc=example,dc=com"]);
        server.shutdown();
    }

    #[test]
    fn test_group_nested_membership_and_cycles() {
        let server = setup_test_server(vec![]);
        server.internal_add(test_person("u1")).expect("add");
        // outer -> inner -> u1, and inner -> outer to close a cycle.
        server
            .internal_add(group_with_members(
                "inner",
                &[
                    "uid=u1,ou=people,dc=example,dc=com",
                    "cn=outer,ou=groups,dc=example,dc=com",
                ],
            ))
            .expect("add inner");
        server
            .internal_add(group_with_members(
                "outer",
                &["cn=inner,ou=groups,dc=example,dc=com"],
            ))
            .expect("add outer");

        let ev = GroupEvaluator::new(&server);
        let outer = dn!("cn=outer,ou=groups,dc=example,dc=com");

        // Transitive closure reaches u1 through inner; the cycle back to
        // outer truncates instead of spinning.
        assert!(ev
            .is_member(&outer, &dn!("uid=u1,ou=people,dc=example,dc=com"))
            .unwrap());
        assert!(!ev
            .is_member(&outer, &dn!("uid=u2,ou=people,dc=example,dc=com"))
            .unwrap());

        let members: Vec<String> = ev
            .members(&outer)
            .unwrap()
            .map(|e| e.get_dn().to_string())
            .collect();
        assert_eq!(members, vec!["uid=u1,ou=people,dc=example,dc=com"]);
        server.shutdown();
    }

    #[test]
    fn test_group_dynamic_membership() {
        let server = setup_test_server(vec![]);
        server.internal_add(test_person("u1")).expect("add");
        server.internal_add(test_person("u2")).expect("add");

        let mut g = crate::entry::Entry::new_init(dn!("cn=dyn,ou=groups,dc=example,dc=com"));
        g.add_ava(ATTR_OBJECTCLASS, Value::new_iutf8(CLASS_GROUPOFURLS));
        g.add_ava(ATTR_CN, Value::new_iutf8("dyn"));
        g.add_ava(ATTR_MEMBERQUERY, Value::new_utf8("(objectclass=inetorgperson)"));
        g.add_ava(
            ATTR_MEMBERQUERYBASE,
            Value::new_dn(dn!("ou=people,dc=example,dc=com")),
        );
        server.internal_add(g).expect("add dyn group");

        let ev = GroupEvaluator::new(&server);
        let gdn = dn!("cn=dyn,ou=groups,dc=example,dc=com");

        assert!(ev
            .is_member(&gdn, &dn!("uid=u1,ou=people,dc=example,dc=com"))
            .unwrap());
        // Outside the query base.
        assert!(!ev
            .is_member(&gdn, &dn!("ou=groups,dc=example,dc=com"))
            .unwrap());

        let mut members: Vec<String> = ev
            .members(&gdn)
            .unwrap()
            .map(|e| e.get_dn().to_string())
            .collect();
        members.sort();
        assert_eq!(
            members,
            vec![
                "uid=u1,ou=people,dc=example,dc=com",
                "uid=u2,ou=people,dc=example,dc=com"
            ]
        );

        // Point in time: adding a person changes the next answer.
        server.internal_add(test_person("u3")).expect("add");
        assert!(ev
            .is_member(&gdn, &dn!("uid=u3,ou=people,dc=example,dc=com"))
            .unwrap());
        server.shutdown();
    }

    #[test]
    fn test_group_members_within_scope_and_filter() {
        let server = setup_test_server(vec![]);
        server.internal_add(test_person("u1")).expect("add");
        server.internal_add(test_person("u2")).expect("add");
        server
            .internal_add(test_group("g1", &["u1", "u2"]))
            .expect("add group");

        let ev = GroupEvaluator::new(&server);
        let g1 = dn!("cn=g1,ou=groups,dc=example,dc=com");

        // Scope restriction.
        let members: Vec<String> = ev
            .members_within(
                &g1,
                &dn!("ou=people,dc=example,dc=com"),
                SearchScope::OneLevel,
                None,
            )
            .unwrap()
            .map(|e| e.get_dn().to_string())
            .collect();
        assert_eq!(members.len(), 2);

        // Filter restriction.
        let f = filter!(f_eq(ATTR_UID, PartialValue::new_iutf8("u2")));
        let members: Vec<String> = ev
            .members_within(
                &g1,
                &dn!("dc=example,dc=com"),
                SearchScope::Subtree,
                Some(&f),
            )
            .unwrap()
            .map(|e| e.get_dn().to_string())
            .collect();
        assert_eq!(members, vec!["uid=u2,ou=people,dc=example,dc=com"]);

        // Entry based membership checks agree with DN based ones.
        let u1 = server
            .get_entry(&dn!("uid=u1,ou=people,dc=example,dc=com"))
            .unwrap()
            .expect("u1 missing");
        assert!(ev.is_member_entry(&g1, &u1).unwrap());
        server.shutdown();
    }

    // Membership reflects referential repair: after the member entry is
    // deleted, the group no longer reports it.
    #[test]
    fn test_group_membership_after_refint_delete() {
        let refint = Arc::new(ReferentialIntegrity::new(RefintConfig {
            attrs: vec![AttrString::from("member")],
            scopes: vec![dn!("dc=example,dc=com")],
            update_interval: Duration::ZERO,
        }));
        let server = setup_test_server(vec![refint as Arc<dyn Plugin>]);
        server.internal_add(test_person("u1")).expect("add");
        server
            .internal_add(test_group("g1", &["u1"]))
            .expect("add group");

        let ev = GroupEvaluator::new(&server);
        let g1 = dn!("cn=g1,ou=groups,dc=example,dc=com");
        let u1 = dn!("uid=u1,ou=people,dc=example,dc=com");
        assert!(ev.is_member(&g1, &u1).unwrap());

        server.internal_delete(&u1, false).expect("delete");
        assert!(!ev.is_member(&g1, &u1).unwrap());
        assert!(server.verify().is_empty());
        server.shutdown();
    }
}
