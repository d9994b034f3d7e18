//! Counting of trial and community users in a region.
//!
//! Users are not listed directly. Every cloud project is named after its owner
//! (`"<owner> cloud"`), so owners are recovered from project names and then looked up one
//! by one. Owners whose record carries no tier marker get a second chance through the
//! role assignments of their project.
use crate::{
    identity::{EndpointGroup, IdentityApi, Project, User},
    Error, Result,
};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeSet;

lazy_static::lazy_static! {
    static ref CLOUD_PROJECT_RE: regex::Regex = regex::Regex::new(r"(?i)\A(.*) cloud").unwrap();
}

/// Default number of user lookups kept in flight.
pub const DEFAULT_JOBS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Trial,
    Community,
    /// Neither tier marker was found; carries the name or id that was looked up.
    Unresolved(String),
}

/// Returns the id of the one endpoint group whose region filter is `region`.
pub fn resolve_region(groups: &[EndpointGroup], region: &str) -> Result<String> {
    let mut matches = groups
        .iter()
        .filter(|g| g.filters.region_id.as_deref() == Some(region));
    match (matches.next(), matches.count()) {
        (Some(group), 0) => Ok(group.id.clone()),
        (None, _) => Err(Error::RegionNotFound(region.to_owned())),
        (Some(_), rest) => Err(Error::AmbiguousRegion {
            region: region.to_owned(),
            count: rest + 1,
        }),
    }
}

/// Keeps the enabled cloud projects.
pub fn eligible_projects(projects: Vec<Project>) -> Vec<Project> {
    projects
        .into_iter()
        .filter(|p| p.is_cloud_project && p.enabled)
        .collect()
}

/// The owner name of a cloud project, `"Foo cloud"` and `"Foo Cloud"` both give `"Foo"`.
pub fn username_from_project(name: &str) -> Option<&str> {
    CLOUD_PROJECT_RE
        .captures(name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

pub fn classify_user(user: &User, looked_up: &str) -> Classification {
    if user.community_started_at.is_some() {
        Classification::Community
    } else if user.trial_started_at.is_some() {
        Classification::Trial
    } else {
        Classification::Unresolved(looked_up.to_owned())
    }
}

/// Classifies a user, turning any lookup failure into [`Classification::Unresolved`].
pub async fn classify<A>(api: &A, name_or_id: &str) -> Classification
where
    A: IdentityApi + ?Sized,
{
    lookup(api, name_or_id)
        .await
        .unwrap_or_else(|_| Classification::Unresolved(name_or_id.to_owned()))
}

async fn lookup<A>(api: &A, name_or_id: &str) -> Result<Classification>
where
    A: IdentityApi + ?Sized,
{
    let user = api.user(name_or_id).await.map_err(|e| {
        tracing::warn!(user = name_or_id, error = %e, "user lookup failed");
        e
    })?;
    let class = classify_user(&user, name_or_id);
    tracing::debug!(user = name_or_id, ?class, "classified");
    Ok(class)
}

/// Names and projects of one region, as returned by [`list_region_users`].
#[derive(Debug, Clone, Default)]
pub struct RegionUsers {
    pub usernames: Vec<String>,
    pub projects: Vec<Project>,
}

pub async fn list_region_users<A>(api: &A, group_id: &str) -> Result<RegionUsers>
where
    A: IdentityApi + ?Sized,
{
    let projects = eligible_projects(api.endpoint_group_projects(group_id).await?);
    let usernames = projects
        .iter()
        .filter_map(|p| username_from_project(&p.name))
        .map(String::from)
        .collect();
    Ok(RegionUsers {
        usernames,
        projects,
    })
}

/// Outcome of the first classification pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tally {
    pub total: usize,
    pub trial: usize,
    pub community: usize,
    pub unresolved: Vec<String>,
    /// Names whose lookup failed outright, these are also part of `unresolved`.
    pub failed: Vec<String>,
}

pub async fn count_users<A>(api: &A, usernames: &[String], jobs: usize) -> Tally
where
    A: IdentityApi + ?Sized,
{
    let outcomes = stream::iter(usernames)
        .map(|name| async move { (name, lookup(api, name).await) })
        .buffer_unordered(jobs.max(1))
        .collect::<Vec<_>>()
        .await;

    let mut tally = Tally {
        total: usernames.len(),
        ..Tally::default()
    };
    for (name, outcome) in outcomes {
        match outcome {
            Ok(Classification::Trial) => tally.trial += 1,
            Ok(Classification::Community) => tally.community += 1,
            Ok(Classification::Unresolved(name)) => tally.unresolved.push(name),
            Err(_) => {
                tally.failed.push(name.clone());
                tally.unresolved.push(name.clone());
            }
        }
    }
    tally
}

/// Community users found through the role assignments of unresolved owners' projects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovery {
    pub community: usize,
    /// Unresolved names for which at least one community user was found.
    pub resolved: Vec<String>,
    /// Names left unresolved after a role listing or user lookup failed.
    pub failed: Vec<String>,
}

/// For every unresolved name, looks at the projects named exactly `"<name> cloud"` or
/// `"<name> Cloud"` and counts the community users holding a role on them.
///
/// A failing role listing or user lookup only affects the name being checked.
pub async fn reclassify_via_roles<A>(
    api: &A,
    unresolved: &[String],
    projects: &[Project],
    jobs: usize,
) -> Recovery
where
    A: IdentityApi + ?Sized,
{
    let mut recovery = Recovery::default();
    for name in unresolved {
        let lower = format!("{} cloud", name);
        let upper = format!("{} Cloud", name);
        let mut user_ids = BTreeSet::new();
        let mut failed = false;
        for project in projects
            .iter()
            .filter(|p| p.name == lower || p.name == upper)
        {
            match api.role_assignments(&project.id).await {
                Ok(assignments) => {
                    user_ids.extend(assignments.into_iter().filter_map(|a| a.user).map(|u| u.id));
                }
                Err(e) => {
                    tracing::warn!(
                        user = %name,
                        project = %project.id,
                        error = %e,
                        "role listing failed"
                    );
                    failed = true;
                }
            }
        }

        let outcomes = stream::iter(&user_ids)
            .map(|id| lookup(api, id))
            .buffer_unordered(jobs.max(1))
            .collect::<Vec<_>>()
            .await;
        failed |= outcomes.iter().any(|o| o.is_err());
        let community = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(Classification::Community)))
            .count();
        tracing::debug!(user = %name, community, "checked project role assignments");
        if community > 0 {
            recovery.community += community;
            recovery.resolved.push(name.clone());
        } else if failed {
            recovery.failed.push(name.clone());
        }
    }
    recovery
}

/// Final figures. `total == trial + community + unresolved.len()` always holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Report {
    pub total: usize,
    pub trial: usize,
    pub community: usize,
    pub unresolved: Vec<String>,
    /// How many of `unresolved` are there because a lookup failed rather than because the
    /// record has no tier marker.
    pub failed: usize,
}

impl Report {
    pub fn new(tally: Tally, recovery: Recovery) -> Self {
        let Tally {
            trial,
            community,
            mut unresolved,
            failed,
            ..
        } = tally;
        unresolved.retain(|name| !recovery.resolved.contains(name));
        unresolved.sort();
        let failed = unresolved
            .iter()
            .filter(|name| failed.contains(name) || recovery.failed.contains(name))
            .count();
        let community = community + recovery.community;
        Report {
            total: trial + community + unresolved.len(),
            trial,
            community,
            unresolved,
            failed,
        }
    }
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Total users: {}", self.total)?;
        writeln!(f, "Trial users: {}", self.trial)?;
        write!(f, "Community users: {}", self.community)
    }
}

/// The whole census for one region.
#[derive(Debug)]
pub struct Census<'a, A: ?Sized> {
    api: &'a A,
    jobs: usize,
}

impl<'a, A> Census<'a, A>
where
    A: IdentityApi + ?Sized,
{
    pub fn new(api: &'a A) -> Self {
        Census {
            api,
            jobs: DEFAULT_JOBS,
        }
    }

    /// Sets how many user lookups may be in flight at once. Zero is treated as one.
    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub async fn run(&self, region: &str) -> Result<Report> {
        tracing::info!(region, "resolving region endpoint group");
        let group_id = resolve_region(&self.api.endpoint_groups().await?, region)?;

        tracing::info!(group = %group_id, "listing users per project");
        let RegionUsers {
            usernames,
            projects,
        } = list_region_users(self.api, &group_id).await?;

        tracing::info!(
            users = usernames.len(),
            projects = projects.len(),
            "counting users per type"
        );
        let tally = count_users(self.api, &usernames, self.jobs).await;
        if !tally.failed.is_empty() {
            tracing::warn!(failed = tally.failed.len(), "some user lookups failed");
        }

        tracing::info!(
            unresolved = tally.unresolved.len(),
            "checking project roles of unresolved users"
        );
        let recovery =
            reclassify_via_roles(self.api, &tally.unresolved, &projects, self.jobs).await;

        let report = Report::new(tally, recovery);
        if !report.unresolved.is_empty() {
            tracing::warn!(unresolved = ?report.unresolved, "users left without a tier");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{AssignedUser, EndpointFilters, RoleAssignment};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeKeystone {
        groups: Vec<EndpointGroup>,
        projects: HashMap<String, Vec<Project>>,
        users: HashMap<String, User>,
        roles: HashMap<String, Vec<RoleAssignment>>,
        forbidden_projects: Vec<String>,
    }

    #[async_trait]
    impl IdentityApi for FakeKeystone {
        async fn endpoint_groups(&self) -> Result<Vec<EndpointGroup>> {
            Ok(self.groups.clone())
        }

        async fn endpoint_group_projects(&self, group_id: &str) -> Result<Vec<Project>> {
            self.projects
                .get(group_id)
                .cloned()
                .ok_or_else(|| Error::Msg(format!("no group {}", group_id).into()))
        }

        async fn user(&self, name_or_id: &str) -> Result<User> {
            self.users
                .get(name_or_id)
                .cloned()
                .ok_or_else(|| Error::Msg(format!("no user {}", name_or_id).into()))
        }

        async fn role_assignments(&self, project_id: &str) -> Result<Vec<RoleAssignment>> {
            if self.forbidden_projects.iter().any(|p| p == project_id) {
                return Err(Error::Msg("403 forbidden".into()));
            }
            Ok(self.roles.get(project_id).cloned().unwrap_or_default())
        }
    }

    fn group(id: &str, region: Option<&str>) -> EndpointGroup {
        EndpointGroup {
            id: id.into(),
            filters: EndpointFilters {
                region_id: region.map(String::from),
            },
        }
    }

    fn project(id: &str, name: &str) -> Project {
        Project {
            id: id.into(),
            name: name.into(),
            is_cloud_project: true,
            enabled: true,
        }
    }

    fn community(id: &str) -> User {
        User {
            id: id.into(),
            community_started_at: Some(json!("2016-05-01")),
            ..User::default()
        }
    }

    fn trial(id: &str) -> User {
        User {
            id: id.into(),
            trial_started_at: Some(json!("2017-02-01")),
            ..User::default()
        }
    }

    fn assigned(user_id: &str) -> RoleAssignment {
        RoleAssignment {
            user: Some(AssignedUser { id: user_id.into() }),
        }
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn region_with_one_match() {
        let groups = vec![
            group("g1", Some("Spain2")),
            group("g2", Some("Berlin2")),
            group("g3", None),
        ];
        assert_eq!(resolve_region(&groups, "Berlin2").unwrap(), "g2");
    }

    #[test]
    fn region_without_match() {
        let groups = vec![group("g1", Some("Spain2"))];
        assert!(matches!(
            resolve_region(&groups, "spain2"),
            Err(Error::RegionNotFound(r)) if r == "spain2"
        ));
        assert!(matches!(resolve_region(&[], "Spain2"), Err(Error::RegionNotFound(_))));
    }

    #[test]
    fn region_with_several_matches() {
        let groups = vec![group("g1", Some("Spain2")), group("g2", Some("Spain2"))];
        assert!(matches!(
            resolve_region(&groups, "Spain2"),
            Err(Error::AmbiguousRegion { count: 2, .. })
        ));
    }

    #[test]
    fn only_enabled_cloud_projects_are_eligible() {
        let mut disabled = project("p2", "b cloud");
        disabled.enabled = false;
        let mut plain = project("p3", "c cloud");
        plain.is_cloud_project = false;
        let input = vec![project("p1", "a cloud"), disabled, plain];
        let out = eligible_projects(input.clone());
        assert!(out.len() <= input.len());
        assert_eq!(out, vec![project("p1", "a cloud")]);
        assert!(out.iter().all(|p| p.is_cloud_project && p.enabled));
    }

    #[test]
    fn owner_names_from_project_names() {
        assert_eq!(username_from_project("Foo cloud"), Some("Foo"));
        assert_eq!(username_from_project("Foo Cloud"), Some("Foo"));
        assert_eq!(username_from_project("Foo CLOUD"), Some("Foo"));
        assert_eq!(username_from_project("Jane Doe cloud"), Some("Jane Doe"));
        assert_eq!(username_from_project("Foo Community"), None);
        assert_eq!(username_from_project("cloud"), None);
    }

    #[test]
    fn community_marker_wins() {
        let mut both = community("u");
        both.trial_started_at = Some(json!("2017-01-01"));
        assert_eq!(classify_user(&community("u"), "u"), Classification::Community);
        assert_eq!(classify_user(&both, "u"), Classification::Community);
        assert_eq!(classify_user(&trial("u"), "u"), Classification::Trial);
        assert_eq!(
            classify_user(&User::default(), "odd"),
            Classification::Unresolved("odd".into())
        );
    }

    #[tokio::test]
    async fn failed_lookup_is_unresolved() {
        let api = FakeKeystone::default();
        assert_eq!(
            classify(&api, "ghost").await,
            Classification::Unresolved("ghost".into())
        );
    }

    #[tokio::test]
    async fn region_users_skip_unmatched_names() {
        let mut api = FakeKeystone::default();
        let mut disabled = project("p4", "zed cloud");
        disabled.enabled = false;
        api.projects.insert(
            "g1".into(),
            vec![
                project("p1", "acme cloud"),
                project("p2", "Beta Cloud"),
                project("p3", "Shared Community"),
                disabled,
            ],
        );
        let RegionUsers {
            mut usernames,
            projects,
        } = list_region_users(&api, "g1").await.unwrap();
        usernames.sort();
        assert_eq!(usernames, names(&["Beta", "acme"]));
        assert_eq!(projects.len(), 3);
        assert!(usernames.len() <= projects.len());
    }

    #[tokio::test]
    async fn tally_counts_every_name_once() {
        let mut api = FakeKeystone::default();
        api.users.insert("a".into(), community("1"));
        api.users.insert("b".into(), trial("2"));
        api.users.insert("c".into(), trial("3"));
        api.users.insert("d".into(), User::default());
        let tally = count_users(&api, &names(&["a", "b", "c", "d", "e"]), 3).await;
        assert_eq!(tally.total, 5);
        assert_eq!(tally.trial, 2);
        assert_eq!(tally.community, 1);
        assert_eq!(tally.failed, names(&["e"]));
        let mut unresolved = tally.unresolved.clone();
        unresolved.sort();
        assert_eq!(unresolved, names(&["d", "e"]));
        assert_eq!(
            tally.total,
            tally.trial + tally.community + tally.unresolved.len()
        );
    }

    #[tokio::test]
    async fn zero_jobs_still_makes_progress() {
        let mut api = FakeKeystone::default();
        api.users.insert("a".into(), trial("1"));
        let tally = count_users(&api, &names(&["a"]), 0).await;
        assert_eq!(tally.trial, 1);
    }

    #[tokio::test]
    async fn fallback_only_matches_exact_suffixes() {
        let mut api = FakeKeystone::default();
        api.users.insert("u1".into(), community("u1"));
        api.users.insert("u2".into(), community("u2"));
        api.users.insert("u3".into(), trial("u3"));
        api.roles.insert("p1".into(), vec![assigned("u1"), assigned("u3")]);
        api.roles.insert("p2".into(), vec![assigned("u1"), assigned("u2")]);
        api.roles.insert("p3".into(), vec![assigned("u2")]);
        let projects = vec![
            project("p1", "beta cloud"),
            project("p2", "beta Cloud"),
            project("p3", "beta CLOUD"),
        ];
        let recovery = reclassify_via_roles(&api, &names(&["beta"]), &projects, 2).await;
        // u1 sits on both projects and is counted once, p3 does not match
        assert_eq!(recovery.community, 2);
        assert_eq!(recovery.resolved, names(&["beta"]));
    }

    #[tokio::test]
    async fn fallback_ignores_classified_names() {
        let mut api = FakeKeystone::default();
        api.users.insert("u1".into(), community("u1"));
        api.roles.insert("p1".into(), vec![assigned("u1")]);
        let projects = vec![project("p1", "acme cloud")];
        let recovery = reclassify_via_roles(&api, &[], &projects, 1).await;
        assert_eq!(recovery, Recovery::default());
    }

    #[tokio::test]
    async fn fallback_without_community_users_keeps_name_unresolved() {
        let mut api = FakeKeystone::default();
        api.users.insert("u3".into(), trial("u3"));
        api.roles.insert("p1".into(), vec![assigned("u3"), RoleAssignment { user: None }]);
        let projects = vec![project("p1", "odd cloud")];
        let recovery = reclassify_via_roles(&api, &names(&["odd", "gone"]), &projects, 1).await;
        assert_eq!(recovery, Recovery::default());

        let report = Report::new(
            Tally {
                total: 2,
                unresolved: names(&["odd", "gone"]),
                failed: names(&["gone"]),
                ..Tally::default()
            },
            recovery,
        );
        assert_eq!(report.total, 2);
        assert_eq!(report.unresolved, names(&["gone", "odd"]));
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn failed_fallback_lookups_are_reported() {
        let mut api = FakeKeystone::default();
        api.roles.insert("p1".into(), vec![assigned("missing-id")]);
        api.forbidden_projects.push("p2".into());
        let projects = vec![project("p1", "odd cloud"), project("p2", "shut Cloud")];
        let recovery =
            reclassify_via_roles(&api, &names(&["odd", "shut", "plain"]), &projects, 1).await;
        assert_eq!(recovery.community, 0);
        assert_eq!(recovery.failed, names(&["odd", "shut"]));
    }

    #[test]
    fn recovered_names_are_not_counted_as_failed() {
        let report = Report::new(
            Tally {
                total: 2,
                community: 1,
                unresolved: names(&["beta"]),
                failed: names(&["beta"]),
                ..Tally::default()
            },
            Recovery {
                community: 1,
                resolved: names(&["beta"]),
                failed: Vec::new(),
            },
        );
        assert_eq!(report.failed, 0);
        assert!(report.unresolved.is_empty());
        assert_eq!(report.total, 2);
    }

    #[tokio::test]
    async fn census_survives_a_forbidden_role_listing() {
        let mut api = FakeKeystone::default();
        api.groups = vec![group("g-es", Some("Spain2"))];
        let mut projects: Vec<Project> = (0..100)
            .map(|i| project(&format!("p{}", i), &format!("user{} cloud", i)))
            .collect();
        projects.push(project("p-bad", "Bad cloud"));
        api.projects.insert("g-es".into(), projects);
        for i in 0..100 {
            api.users
                .insert(format!("user{}", i), community(&format!("id{}", i)));
        }
        api.users.insert("Bad".into(), User::default());
        api.forbidden_projects.push("p-bad".into());

        let report = Census::new(&api).run("Spain2").await.unwrap();
        assert_eq!(report.community, 100);
        assert_eq!(report.unresolved, names(&["Bad"]));
        assert_eq!(report.failed, 1);
        assert_eq!(report.total, 101);
    }

    #[tokio::test]
    async fn census_end_to_end() {
        let mut api = FakeKeystone::default();
        api.groups = vec![group("g-es", Some("Spain2")), group("g-de", Some("Berlin2"))];
        api.projects.insert(
            "g-es".into(),
            vec![project("p-acme", "Acme cloud"), project("p-beta", "Beta Cloud")],
        );
        api.users.insert("Acme".into(), community("acme-id"));
        api.users.insert("Beta".into(), User::default());
        api.users.insert("beta-id".into(), community("beta-id"));
        api.roles.insert("p-beta".into(), vec![assigned("beta-id")]);

        let report = Census::new(&api).jobs(4).run("Spain2").await.unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.trial, 0);
        assert_eq!(report.community, 2);
        assert!(report.unresolved.is_empty());
        assert_eq!(report.failed, 0);
        assert_eq!(
            report.to_string(),
            "Total users: 2\nTrial users: 0\nCommunity users: 2"
        );
    }

    #[tokio::test]
    async fn census_aborts_on_unknown_region() {
        let api = FakeKeystone {
            groups: vec![group("g-es", Some("Spain2"))],
            ..FakeKeystone::default()
        };
        assert!(matches!(
            Census::new(&api).run("Mexico").await,
            Err(Error::RegionNotFound(_))
        ));
    }

    #[test]
    fn report_serializes_all_counts() {
        let report = Report {
            total: 3,
            trial: 1,
            community: 1,
            unresolved: names(&["x"]),
            failed: 0,
        };
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({"total": 3, "trial": 1, "community": 1, "unresolved": ["x"], "failed": 0})
        );
    }
}
