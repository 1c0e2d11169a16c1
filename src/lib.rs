//! shiftcheck: checklist execution, scoring and gamification service.

pub mod action_plans;
pub mod api;
pub mod checklist;
pub mod config;
pub mod error;
pub mod evidence;
pub mod gamification;
pub mod store;
