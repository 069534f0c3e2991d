//! Central navigation policy.
//!
//! Views never gate themselves; every navigation runs [`evaluate`] and obeys
//! the verdict, so the redirect rules live in exactly one place.

use verbatim_types::models::{AssessmentState, Role};

use crate::session::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Login,
    Register,
    ClientDashboard,
    TranscriberDashboard,
    TraineeDashboard,
    AdminDashboard,
    Assessment,
    TrainingPayment,
}

impl Route {
    fn is_public(self) -> bool {
        matches!(self, Route::Login | Route::Register)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Session still resolving; render a neutral loading state only.
    Loading,
    Allow,
    Redirect(Route),
}

/// Each role's home page.
pub fn landing(role: Role) -> Route {
    match role {
        Role::Client => Route::ClientDashboard,
        Role::Transcriber => Route::TranscriberDashboard,
        Role::Trainee => Route::TraineeDashboard,
        Role::Admin => Route::AdminDashboard,
    }
}

/// Decide what happens when `route` is visited under `state`. Pure; re-run
/// on every navigation, so multi-step redirects settle one hop at a time.
pub fn evaluate(state: &SessionState, route: Route) -> Access {
    let user = match state {
        SessionState::Unknown => return Access::Loading,
        SessionState::SignedOut => {
            return if route.is_public() {
                Access::Allow
            } else {
                Access::Redirect(Route::Login)
            };
        }
        SessionState::SignedIn(session) => &session.user,
    };

    // Signed-in users have no business on the auth pages.
    if route.is_public() {
        return Access::Redirect(landing(user.role));
    }

    match user.role {
        Role::Client => match route {
            Route::ClientDashboard => Access::Allow,
            _ => Access::Redirect(Route::ClientDashboard),
        },

        Role::Admin => match route {
            Route::AdminDashboard => Access::Allow,
            _ => Access::Redirect(Route::AdminDashboard),
        },

        // Transcribers are pinned to the assessment until they pass it.
        Role::Transcriber => {
            let passed = user.assessment == Some(AssessmentState::Passed);
            match route {
                Route::Assessment => {
                    if passed {
                        Access::Redirect(Route::TranscriberDashboard)
                    } else {
                        Access::Allow
                    }
                }
                Route::TranscriberDashboard => {
                    if passed {
                        Access::Allow
                    } else {
                        Access::Redirect(Route::Assessment)
                    }
                }
                _ => Access::Redirect(Route::TranscriberDashboard),
            }
        }

        // Trainees are pinned to the payment page until the fee clears.
        Role::Trainee => {
            let paid = user.training_paid == Some(true);
            match route {
                Route::TrainingPayment => {
                    if paid {
                        Access::Redirect(Route::TraineeDashboard)
                    } else {
                        Access::Allow
                    }
                }
                Route::TraineeDashboard => {
                    if paid {
                        Access::Allow
                    } else {
                        Access::Redirect(Route::TrainingPayment)
                    }
                }
                _ => Access::Redirect(Route::TraineeDashboard),
            }
        }
    }
}
