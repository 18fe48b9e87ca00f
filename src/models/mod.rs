pub mod canonical;
pub mod company;
pub mod document;
pub mod result;

pub use canonical::{LineItem, ParsedDocument};
pub use company::{Company, ContactUpdate, NewCompany};
pub use document::{DocType, Document, DocumentStatus, NewDocument, ParseOutput};
pub use result::{
    ComparisonScope, ComparisonStatus, FieldComparison, MatchPair, MatchResult, OverallStatus,
};
