use std::sync::Arc;

use axum::extract::FromRef;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::response::Redirect;
use axum_extra::extract::cookie::{Cookie, CookieJar};
use dashmap::DashMap;
use uuid::Uuid;

use crate::vision::AnalysisKind;

pub type SessionId = Uuid;

const SESSION_COOKIE: &str = "session_id";

/// Everything the UI remembers for one browser session.
///
/// The three result fields are independent: a run overwrites only the fields
/// whose kind was selected, and nothing else clears them. The active image
/// is replaced wholesale on upload and does not touch the results.
#[derive(Clone, Debug, Default)]
pub struct SessionState {
    pub scene_description: String,
    pub extracted_text: String,
    pub object_analysis: String,
    pub image: Option<UploadedImage>,
    pub selection: Vec<AnalysisKind>,
    /// One-shot error notice, cleared when rendered
    pub notice: Option<String>,
}

#[derive(Clone, Debug)]
pub struct UploadedImage {
    /// Lossy webp re-encoding of the upload, used for display and analysis
    pub webp: Vec<u8>,
    pub filename: String,
}

impl SessionState {
    pub fn result(&self, kind: AnalysisKind) -> &str {
        match kind {
            AnalysisKind::Scene => &self.scene_description,
            AnalysisKind::Text => &self.extracted_text,
            AnalysisKind::Objects => &self.object_analysis,
        }
    }

    pub fn set_result(&mut self, kind: AnalysisKind, text: String) {
        match kind {
            AnalysisKind::Scene => self.scene_description = text,
            AnalysisKind::Text => self.extracted_text = text,
            AnalysisKind::Objects => self.object_analysis = text,
        }
    }

    pub fn is_selected(&self, kind: AnalysisKind) -> bool {
        self.selection.contains(&kind)
    }
}

/// In-process session store, keyed by an opaque cookie.
///
/// Sessions are private to one browser and live for the process lifetime.
/// This only works for a single server deployment; there is no cross-session
/// sharing, so no coordination beyond the map itself is needed.
#[derive(Clone, Default)]
pub struct Sessions {
    sessions: Arc<DashMap<SessionId, SessionState>>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session id from the cookie jar, if the cookie names a live session.
    pub fn lookup(&self, jar: &CookieJar) -> Option<SessionId> {
        let id = jar.get(SESSION_COOKIE)?.value().parse::<Uuid>().ok()?;
        self.sessions.contains_key(&id).then_some(id)
    }

    /// Existing session from the jar, or a fresh one with its cookie set.
    pub fn ensure(&self, jar: CookieJar) -> (CookieJar, SessionId) {
        if let Some(id) = self.lookup(&jar) {
            return (jar, id);
        }
        let id = Uuid::new_v4();
        self.sessions.insert(id, SessionState::default());
        tracing::info!("Started session {}", id);
        let cookie = Cookie::build((SESSION_COOKIE, id.to_string()))
            .path("/")
            .http_only(true)
            .build();
        (jar.add(cookie), id)
    }

    /// Snapshot of the session for rendering.
    pub fn read(&self, id: SessionId) -> Option<SessionState> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    /// Mutate the session in place. Returns None if the session is gone.
    pub fn with_mut<R>(&self, id: SessionId, f: impl FnOnce(&mut SessionState) -> R) -> Option<R> {
        self.sessions.get_mut(&id).map(|mut s| f(&mut s))
    }

    /// Take the one-shot notice, leaving the session without one.
    pub fn take_notice(&self, id: SessionId) -> Option<String> {
        self.with_mut(id, |s| s.notice.take()).flatten()
    }
}

/// Request guard for actions that only make sense inside a session
/// (upload, run, speak). Without one, the user is sent back to the
/// start page, which creates it.
pub struct ActiveSession(pub SessionId);

#[axum::async_trait]
impl<S> FromRequestParts<S> for ActiveSession
where
    Sessions: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Redirect;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        // Extract the session cookie and look up the session in the store (infallible)
        let jar = CookieJar::from_request_parts(parts, state).await.unwrap();
        let sessions = Sessions::from_ref(state);
        sessions
            .lookup(&jar)
            .map(ActiveSession)
            .ok_or(Redirect::to("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_fields_are_independent() {
        let mut state = SessionState::default();
        state.set_result(AnalysisKind::Scene, "a porch at dusk".into());
        state.set_result(AnalysisKind::Text, "EXIT".into());
        assert_eq!(state.result(AnalysisKind::Scene), "a porch at dusk");
        assert_eq!(state.result(AnalysisKind::Text), "EXIT");
        assert_eq!(state.result(AnalysisKind::Objects), "");

        // Overwriting one field leaves the others alone
        state.set_result(AnalysisKind::Text, "ENTRANCE".into());
        assert_eq!(state.result(AnalysisKind::Scene), "a porch at dusk");
        assert_eq!(state.result(AnalysisKind::Objects), "");
    }

    #[test]
    fn replacing_the_image_keeps_results() {
        let mut state = SessionState::default();
        state.image = Some(UploadedImage {
            webp: vec![1, 2, 3],
            filename: "cat.jpg".into(),
        });
        state.set_result(AnalysisKind::Scene, "a cat".into());

        state.image = Some(UploadedImage {
            webp: vec![4, 5, 6],
            filename: "dog.png".into(),
        });
        assert_eq!(state.result(AnalysisKind::Scene), "a cat");
        assert_eq!(state.image.as_ref().unwrap().filename, "dog.png");
    }

    #[test]
    fn notice_is_one_shot() {
        let sessions = Sessions::new();
        let (_, id) = sessions.ensure(CookieJar::new());
        sessions.with_mut(id, |s| s.notice = Some("Text-to-Speech error: no device".into()));
        assert_eq!(
            sessions.take_notice(id).as_deref(),
            Some("Text-to-Speech error: no device")
        );
        assert_eq!(sessions.take_notice(id), None);
    }

    #[test]
    fn ensure_reuses_a_live_session() {
        let sessions = Sessions::new();
        let (jar, id) = sessions.ensure(CookieJar::new());
        let (_, id_again) = sessions.ensure(jar);
        assert_eq!(id, id_again);
    }

    #[test]
    fn stale_cookie_gets_a_fresh_session() {
        let sessions = Sessions::new();
        let jar = CookieJar::new().add(Cookie::new(SESSION_COOKIE, Uuid::new_v4().to_string()));
        assert!(sessions.lookup(&jar).is_none());
        let (_, id) = sessions.ensure(jar);
        assert!(sessions.read(id).is_some());
    }
}
