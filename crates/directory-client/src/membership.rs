//! Group membership resolution.
//!
//! Active Directory answers "which groups is this user in, transitively" through the
//! constructed `tokenGroups` attribute, which is only returned for base-scope reads of the user
//! object. Members of a group, transitively, come from the in-chain matching rule on
//! `memberOf`.

use crate::{
    principal::{Principal, PrincipalKind},
    schema::escape_value,
    search::{SearchEngine, SearchOutcome},
    session::{search_all, DirectorySession, SearchRequest, SearchScope},
    Result,
};
use directory_core::SecurityIdentifier;
use tracing::{debug, warn};

/// `LDAP_MATCHING_RULE_IN_CHAIN`.
pub const IN_CHAIN_RULE_OID: &str = "1.2.840.113556.1.4.1941";

/// SIDs per group lookup filter.
const SID_BATCH: usize = 64;

/// Resolves group closures with a [`SearchEngine`].
#[derive(Debug, Clone, Copy)]
pub struct MembershipResolver<'a> {
    engine: &'a SearchEngine,
}

impl<'a> MembershipResolver<'a> {
    /// Creates a resolver.
    #[must_use]
    pub const fn new(engine: &'a SearchEngine) -> Self {
        Self { engine }
    }

    /// Groups `user` belongs to, directly or through nesting.
    ///
    /// # Errors
    ///
    /// Returns transport and protocol errors; unreadable entries and malformed SIDs are
    /// skipped and counted.
    pub async fn groups_of_user(
        &self,
        session: &mut dyn DirectorySession,
        user: &Principal,
        recursive: bool,
    ) -> Result<SearchOutcome> {
        let base = self.engine.base(session).await?;
        if !recursive {
            let filter = format!(
                "(&{}(member={}))",
                self.group_filter(),
                escape_value(user.dn.as_str())
            );
            let request = self.engine.lookup_request(&base, &filter);
            return self.engine.collect(session, &request, None).await;
        }

        let (sids, malformed) = self.token_groups(session, user).await?;
        let mut outcome = SearchOutcome {
            principals: Vec::new(),
            skipped: malformed,
        };
        for batch in sids.chunks(SID_BATCH) {
            let alternatives = batch
                .iter()
                .map(|sid| format!("(objectSid={})", sid.to_filter_value()))
                .collect::<String>();
            let filter = format!("(&{}(|{alternatives}))", self.group_filter());
            let request = self.engine.lookup_request(&base, &filter);
            let found = self.engine.collect(session, &request, None).await?;
            outcome.principals.extend(found.principals);
            outcome.skipped += found.skipped;
        }

        debug!(
            user = %user.dn,
            groups = outcome.principals.len(),
            token_groups = sids.len(),
            "resolved nested group membership"
        );
        Ok(outcome)
    }

    /// Members of `group`; with `recursive`, the non-group leaves of nested groups.
    ///
    /// # Errors
    ///
    /// Returns transport and protocol errors; unreadable entries are skipped and counted.
    pub async fn members_of_group(
        &self,
        session: &mut dyn DirectorySession,
        group: &Principal,
        recursive: bool,
    ) -> Result<SearchOutcome> {
        let base = self.engine.base(session).await?;
        let dn = escape_value(group.dn.as_str());
        let filter = if recursive {
            format!("(&(memberOf:{IN_CHAIN_RULE_OID}:={dn})(!(objectClass=group)))")
        } else {
            format!("(memberOf={dn})")
        };
        let request = self.engine.lookup_request(&base, &filter);
        self.engine.collect(session, &request, None).await
    }

    /// Returns true if `group` is among `groups`.
    #[must_use]
    pub fn contains(groups: &[Principal], group: &Principal) -> bool {
        groups.iter().any(|candidate| candidate.same_principal(group))
    }

    fn group_filter(&self) -> &'static str {
        self.engine.schema().kind_filter(PrincipalKind::Group)
    }

    /// Reads and decodes `tokenGroups` of `user`, returning the SIDs and the count of
    /// malformed values.
    async fn token_groups(
        &self,
        session: &mut dyn DirectorySession,
        user: &Principal,
    ) -> Result<(Vec<SecurityIdentifier>, usize)> {
        let request = SearchRequest::new(user.dn.as_str(), SearchScope::Base, "(objectClass=*)")
            .attributes(["tokenGroups"]);
        let entries = search_all(session, &request).await?;

        let mut sids = Vec::new();
        let mut malformed = 0;
        for entry in &entries {
            for raw in entry.binary_values("tokenGroups") {
                match SecurityIdentifier::from_bytes(raw) {
                    Ok(sid) if !sids.contains(&sid) => sids.push(sid),
                    Ok(_) => {}
                    Err(err) => {
                        warn!(user = %user.dn, error = %err, "skipping malformed token group");
                        malformed += 1;
                    }
                }
            }
        }
        Ok((sids, malformed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dn::DistinguishedName;
    use crate::schema::AttributeSchema;
    use crate::session::{testing::ScriptedCursor, LdapEntry, MockDirectorySession};
    use directory_core::IdentityType;
    use std::collections::HashMap;
    use tracing_test::traced_test;

    fn engine() -> SearchEngine {
        SearchEngine::new(
            AttributeSchema::default(),
            IdentityType::SamAccountName,
            50,
            Some(DistinguishedName::parse("DC=corp").unwrap()),
        )
    }

    fn sid(rid: u32) -> SecurityIdentifier {
        SecurityIdentifier::parse(&format!("S-1-5-21-7-8-9-{rid}")).unwrap()
    }

    fn group_entry(name: &str, rid: u32) -> LdapEntry {
        LdapEntry::new(format!("CN={name},OU=Groups,DC=corp"), HashMap::new(), HashMap::new())
            .with_values("objectClass", ["top", "group"])
            .with_values("sAMAccountName", [name])
            .with_binary("objectSid", vec![sid(rid).to_bytes()])
    }

    fn principal(entry: &LdapEntry) -> Principal {
        Principal::from_entry(entry, &AttributeSchema::default()).unwrap()
    }

    fn user() -> Principal {
        principal(
            &LdapEntry::new("CN=Jane (Ops),OU=Staff,DC=corp", HashMap::new(), HashMap::new())
                .with_values("objectClass", ["user"])
                .with_binary("objectSid", vec![sid(1106).to_bytes()]),
        )
    }

    #[tokio::test]
    #[traced_test]
    async fn nested_groups_come_from_token_groups() {
        let mut session = MockDirectorySession::new();
        session
            .expect_search()
            .withf(|request| request.scope == SearchScope::Base)
            .times(1)
            .returning(|request| {
                assert_eq!(request.base, "CN=Jane (Ops),OU=Staff,DC=corp");
                assert_eq!(request.attributes, vec!["tokenGroups"]);
                Ok(Box::new(ScriptedCursor::new(vec![LdapEntry::default()
                    .with_binary(
                        "tokenGroups",
                        vec![sid(512).to_bytes(), vec![0x01, 0x09], sid(513).to_bytes()],
                    )])))
            });
        session
            .expect_search()
            .withf(|request| request.scope == SearchScope::Subtree)
            .times(1)
            .returning(|request| {
                assert_eq!(
                    request.filter,
                    format!(
                        "(&(objectClass=group)(|(objectSid={})(objectSid={})))",
                        sid(512).to_filter_value(),
                        sid(513).to_filter_value()
                    )
                );
                Ok(Box::new(ScriptedCursor::new(vec![
                    group_entry("Domain Admins", 512),
                    group_entry("Domain Users", 513),
                ])))
            });

        let outcome = MembershipResolver::new(&engine())
            .groups_of_user(&mut session, &user(), true)
            .await
            .unwrap();

        assert_eq!(outcome.principals.len(), 2);
        assert_eq!(outcome.skipped, 1);
        assert!(logs_contain("skipping malformed token group"));
    }

    #[tokio::test]
    async fn direct_groups_match_on_member() {
        let mut session = MockDirectorySession::new();
        session
            .expect_search()
            .withf(|request| {
                request.filter == "(&(objectClass=group)(member=CN=Jane \\28Ops\\29,OU=Staff,DC=corp))"
            })
            .times(1)
            .returning(|_| Ok(Box::new(ScriptedCursor::new(vec![group_entry("Staff", 2001)]))));

        let outcome = MembershipResolver::new(&engine())
            .groups_of_user(&mut session, &user(), false)
            .await
            .unwrap();
        assert_eq!(outcome.principals[0].account_name.as_deref(), Some("Staff"));
    }

    #[tokio::test]
    async fn recursive_members_use_the_in_chain_rule() {
        let group = principal(&group_entry("Admins", 512));
        let mut session = MockDirectorySession::new();
        session
            .expect_search()
            .withf(|request| {
                request.filter
                    == "(&(memberOf:1.2.840.113556.1.4.1941:=CN=Admins,OU=Groups,DC=corp)\
                        (!(objectClass=group)))"
            })
            .times(1)
            .returning(|_| Ok(Box::new(ScriptedCursor::new(Vec::new()))));

        let outcome = MembershipResolver::new(&engine())
            .members_of_group(&mut session, &group, true)
            .await
            .unwrap();
        assert!(outcome.principals.is_empty());
    }

    #[tokio::test]
    async fn direct_members_use_member_of() {
        let group = principal(&group_entry("Admins", 512));
        let mut session = MockDirectorySession::new();
        session
            .expect_search()
            .withf(|request| request.filter == "(memberOf=CN=Admins,OU=Groups,DC=corp)")
            .times(1)
            .returning(|_| Ok(Box::new(ScriptedCursor::new(Vec::new()))));

        MembershipResolver::new(&engine())
            .members_of_group(&mut session, &group, false)
            .await
            .unwrap();
    }

    #[test]
    fn containment_compares_sids() {
        let admins = principal(&group_entry("Admins", 512));
        let users = principal(&group_entry("Users", 513));
        let mut renamed = admins.clone();
        renamed.dn = DistinguishedName::parse("CN=Administrators,OU=Groups,DC=corp").unwrap();

        assert!(MembershipResolver::contains(&[users.clone(), admins], &renamed));
        assert!(!MembershipResolver::contains(&[users], &renamed));
    }
}
