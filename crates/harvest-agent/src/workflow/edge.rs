/// Where an edge leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Node(String),
    End,
}

impl Target {
    pub fn node(name: impl Into<String>) -> Self {
        Self::Node(name.into())
    }

    pub fn as_node(&self) -> Option<&str> {
        match self {
            Self::Node(name) => Some(name),
            Self::End => None,
        }
    }
}

/// A pure routing function over the run state, returning a route label.
pub type Guard<S> = fn(&S) -> &'static str;

/// An outgoing transition of a node.
pub enum Edge<S> {
    /// Always go to `to`.
    Always { from: String, to: Target },
    /// Call `guard` and follow the route with the returned label.
    Conditional {
        from: String,
        guard: Guard<S>,
        routes: Vec<(String, Target)>,
    },
}

impl<S> Clone for Edge<S> {
    fn clone(&self) -> Self {
        match self {
            Self::Always { from, to } => Self::Always {
                from: from.clone(),
                to: to.clone(),
            },
            Self::Conditional {
                from,
                guard,
                routes,
            } => Self::Conditional {
                from: from.clone(),
                guard: *guard,
                routes: routes.clone(),
            },
        }
    }
}

impl<S> std::fmt::Debug for Edge<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Always { from, to } => f
                .debug_struct("Always")
                .field("from", from)
                .field("to", to)
                .finish(),
            Self::Conditional { from, routes, .. } => f
                .debug_struct("Conditional")
                .field("from", from)
                .field("routes", routes)
                .finish(),
        }
    }
}

impl<S> Edge<S> {
    /// Create an unconditional edge.
    pub fn always(from: impl Into<String>, to: Target) -> Self {
        Self::Always {
            from: from.into(),
            to,
        }
    }

    /// Create a guarded edge with its route table.
    pub fn conditional<L: Into<String>>(
        from: impl Into<String>,
        guard: Guard<S>,
        routes: impl IntoIterator<Item = (L, Target)>,
    ) -> Self {
        Self::Conditional {
            from: from.into(),
            guard,
            routes: routes.into_iter().map(|(l, t)| (l.into(), t)).collect(),
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Self::Always { from, .. } | Self::Conditional { from, .. } => from,
        }
    }

    /// Every target this edge can lead to.
    pub fn targets(&self) -> Vec<&Target> {
        match self {
            Self::Always { to, .. } => vec![to],
            Self::Conditional { routes, .. } => routes.iter().map(|(_, t)| t).collect(),
        }
    }
}
