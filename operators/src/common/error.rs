use std::{error::Error, fmt};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SchemeErrorKind {
    TypeNotSupport,
    TypeMismatch,
    RankNotSupport,
    ShapeNotSupport,
    ShapeMismatch,
    StridesNotSupport,
    ArgsNotSupport,
    ResourceExhausted,
}

#[derive(Clone, Debug)]
pub struct SchemeError {
    pub kind: SchemeErrorKind,
    pub info: String,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LaunchErrorKind {
    Scheme(SchemeErrorKind),
    ExecutionFailed,
}

#[derive(Clone, Debug)]
pub struct LaunchError {
    pub kind: LaunchErrorKind,
    pub info: String,
}

impl From<SchemeError> for LaunchError {
    #[inline]
    fn from(SchemeError { kind, info }: SchemeError) -> Self {
        Self {
            kind: LaunchErrorKind::Scheme(kind),
            info,
        }
    }
}

impl fmt::Display for SchemeError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: \"{}\"", self.kind, self.info)
    }
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            LaunchErrorKind::Scheme(kind) => write!(f, "{kind:?}: \"{}\"", self.info),
            LaunchErrorKind::ExecutionFailed => write!(f, "ExecutionFailed: \"{}\"", self.info),
        }
    }
}

impl Error for SchemeError {}
impl Error for LaunchError {}

pub(super) mod functions {
    use super::{LaunchError, LaunchErrorKind::ExecutionFailed, SchemeError, SchemeErrorKind::*};

    macro_rules! builder {
        ($ty:ident: $name:ident $kind:expr) => {
            #[inline]
            pub fn $name(info: impl Into<String>) -> $ty {
                $ty {
                    kind: $kind,
                    info: info.into(),
                }
            }
        };
    }

    builder!(SchemeError: type_not_support    TypeNotSupport   );
    builder!(SchemeError: type_mismatch       TypeMismatch     );
    builder!(SchemeError: rank_not_support    RankNotSupport   );
    builder!(SchemeError: shape_not_support   ShapeNotSupport  );
    builder!(SchemeError: shape_mismatch      ShapeMismatch    );
    builder!(SchemeError: strides_not_support StridesNotSupport);
    builder!(SchemeError: args_not_support    ArgsNotSupport   );
    builder!(SchemeError: resource_exhausted  ResourceExhausted);

    builder!(LaunchError: execution_failed    ExecutionFailed  );
}

#[test]
fn test_display() {
    use functions::{execution_failed, shape_not_support};

    let e = LaunchError::from(shape_not_support("d = 0"));
    assert_eq!(
        e.kind,
        LaunchErrorKind::Scheme(SchemeErrorKind::ShapeNotSupport)
    );
    assert_eq!(e.to_string(), "ShapeNotSupport: \"d = 0\"");

    let e = execution_failed("poisoned");
    assert_eq!(e.to_string(), "ExecutionFailed: \"poisoned\"");
}
