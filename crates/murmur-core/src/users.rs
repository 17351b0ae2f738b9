//! User registration, lookup and listing.

use murmur_db::{DbError, RelationDirection, RelationSearch, UserSearch};
use murmur_types::{User, UserId, UserProfile};

use crate::error::SocialError;
use crate::service::SocialService;
use crate::validate;

impl SocialService {
    /// Register a user.
    ///
    /// # Errors
    ///
    /// - [`SocialError::Validation`] for a malformed email or username, or
    ///   if either is already taken.
    /// - [`SocialError::Store`] on storage failure.
    pub async fn create_user(&self, email: &str, username: &str) -> Result<User, SocialError> {
        let email = validate::email(email)?;
        let username = validate::username(username)?;
        match self.store.create_user(email, username).await {
            Ok(user) => {
                tracing::info!(user_id = %user.id, username = %user.username, "user created");
                Ok(user)
            }
            Err(DbError::UniqueViolation(_)) => Err(SocialError::validation(
                "email or username already taken",
            )),
            Err(err) => Err(SocialError::Store(err)),
        }
    }

    /// Public identity of one user.
    ///
    /// # Errors
    ///
    /// [`SocialError::NotFound`] if no such user exists.
    pub async fn user_by_id(&self, id: UserId) -> Result<User, SocialError> {
        self.store
            .user_by_id(id)
            .await?
            .ok_or(SocialError::NotFound("user"))
    }

    /// Profile of `username` as seen by `viewer`.
    ///
    /// # Errors
    ///
    /// [`SocialError::NotFound`] if no such user exists.
    pub async fn user_profile(
        &self,
        viewer: Option<UserId>,
        username: &str,
    ) -> Result<UserProfile, SocialError> {
        let username = validate::username(username)?;
        self.store
            .user_profile(viewer, username)
            .await?
            .map(UserProfile::redacted)
            .ok_or(SocialError::NotFound("user"))
    }

    /// Users ordered by username, optionally filtered by a
    /// case-insensitive substring and starting after a username cursor.
    ///
    /// # Errors
    ///
    /// [`SocialError::Store`] on storage failure.
    pub async fn users(
        &self,
        viewer: Option<UserId>,
        search: Option<&str>,
        first: i64,
        after: Option<&str>,
    ) -> Result<Vec<UserProfile>, SocialError> {
        let search = UserSearch {
            viewer,
            search: search
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned),
            after: after.map(str::to_owned),
            first: validate::page_size(first),
        };
        let profiles = self.store.users(&search).await?;
        Ok(profiles.into_iter().map(UserProfile::redacted).collect())
    }

    /// Users following `username`, ordered by username.
    ///
    /// An unknown username yields an empty list.
    ///
    /// # Errors
    ///
    /// [`SocialError::Store`] on storage failure.
    pub async fn followers(
        &self,
        viewer: Option<UserId>,
        username: &str,
        first: i64,
        after: Option<&str>,
    ) -> Result<Vec<UserProfile>, SocialError> {
        self.relations(viewer, username, RelationDirection::Followers, first, after)
            .await
    }

    /// Users `username` follows, ordered by username.
    ///
    /// An unknown username yields an empty list.
    ///
    /// # Errors
    ///
    /// [`SocialError::Store`] on storage failure.
    pub async fn followees(
        &self,
        viewer: Option<UserId>,
        username: &str,
        first: i64,
        after: Option<&str>,
    ) -> Result<Vec<UserProfile>, SocialError> {
        self.relations(viewer, username, RelationDirection::Followees, first, after)
            .await
    }

    async fn relations(
        &self,
        viewer: Option<UserId>,
        username: &str,
        direction: RelationDirection,
        first: i64,
        after: Option<&str>,
    ) -> Result<Vec<UserProfile>, SocialError> {
        let search = RelationSearch {
            viewer,
            username: username.trim().to_owned(),
            direction,
            after: after.map(str::to_owned),
            first: validate::page_size(first),
        };
        let profiles = self.store.relations(&search).await?;
        Ok(profiles.into_iter().map(UserProfile::redacted).collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use crate::error::SocialError;
    use crate::service::tests::{register, service};

    #[tokio::test]
    async fn duplicate_username_is_a_validation_error() {
        let (service, _pool) = service();
        register(&service, "ana").await;
        let err = service
            .create_user("other@example.com", "ana")
            .await
            .unwrap_err();
        assert!(matches!(err, SocialError::Validation(_)));
        assert_eq!(err.public_message(), "email or username already taken");
    }

    #[tokio::test]
    async fn registration_validates_input() {
        let (service, _pool) = service();
        assert!(matches!(
            service.create_user("nope", "ana").await,
            Err(SocialError::Validation(_))
        ));
        assert!(matches!(
            service.create_user("ana@example.com", "a b").await,
            Err(SocialError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn registration_trims_input() {
        let (service, _pool) = service();
        let user = service
            .create_user(" ana@example.com ", " ana ")
            .await
            .unwrap();
        assert_eq!(user.username, "ana");
        assert_eq!(service.user_by_id(user.id).await.unwrap(), user);
    }

    #[tokio::test]
    async fn profiles_of_others_are_redacted() {
        let (service, _pool) = service();
        let ana = register(&service, "ana").await;
        register(&service, "bob").await;

        let own = service.user_profile(Some(ana), "ana").await.unwrap();
        assert!(own.me);
        assert_eq!(own.id, Some(ana));
        assert_eq!(own.email.as_deref(), Some("ana@example.com"));

        let other = service.user_profile(Some(ana), "bob").await.unwrap();
        assert!(!other.me);
        assert_eq!(other.id, None);
        assert_eq!(other.email, None);

        let anonymous = service.user_profile(None, "ana").await.unwrap();
        assert_eq!(anonymous.email, None);
    }

    #[tokio::test]
    async fn unknown_profile_is_not_found() {
        let (service, _pool) = service();
        assert!(matches!(
            service.user_profile(None, "ghost").await,
            Err(SocialError::NotFound("user"))
        ));
        assert!(matches!(
            service.user_by_id(murmur_types::UserId::new()).await,
            Err(SocialError::NotFound("user"))
        ));
    }

    #[tokio::test]
    async fn users_search_and_cursor() {
        let (service, _pool) = service();
        for name in ["alice", "bob", "malia", "zed"] {
            register(&service, name).await;
        }

        let names = |list: Vec<murmur_types::UserProfile>| {
            list.into_iter().map(|p| p.username).collect::<Vec<_>>()
        };
        assert_eq!(
            names(service.users(None, Some("LI"), 0, None).await.unwrap()),
            ["alice", "malia"]
        );
        assert_eq!(
            names(service.users(None, Some("  "), 2, Some("alice")).await.unwrap()),
            ["bob", "malia"]
        );
    }

    #[tokio::test]
    async fn followers_and_followees_lists() {
        let (service, _pool) = service();
        let ana = register(&service, "ana").await;
        let bob = register(&service, "bob").await;
        register(&service, "cid").await;
        service.toggle_follow(ana, "cid").await.unwrap();
        service.toggle_follow(bob, "cid").await.unwrap();

        let followers = service.followers(Some(ana), "cid", 0, None).await.unwrap();
        let names: Vec<_> = followers.iter().map(|p| p.username.as_str()).collect();
        assert_eq!(names, ["ana", "bob"]);
        assert!(followers.iter().all(|p| p.email.is_none() || p.me));

        let followees = service.followees(None, "ana", 0, None).await.unwrap();
        assert_eq!(followees.len(), 1);
        assert_eq!(followees[0].username, "cid");

        assert!(service.followers(None, "ghost", 0, None).await.unwrap().is_empty());
    }
}
