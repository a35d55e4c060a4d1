pub mod compare;
pub mod init;
pub mod list_predictors;
pub mod run;
pub mod validate;
