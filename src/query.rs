// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Query cache (component H): signature-indexed, materialized lists of
//! archetype indices, incrementally updated as archetypes are created.
//!
//! Queries here are plain subset tests over [`VectorSignature`]s rather than
//! the old generic, `TypeId`-keyed `QueryFilter`/`QueryFetch` machinery —
//! components are opaque byte ids now, so there is no type to dispatch on.
//! What survives from that design is the cache-and-incrementally-update
//! shape: register once, then let `update_add` keep the result list current
//! as the world creates new archetypes, rather than rescanning every query
//! on every call.

use crate::signature::VectorSignature;

/// A registered query: archetypes whose unique-vector signature is a
/// superset of `required` and shares no id with `excluded`.
struct Query {
    required: VectorSignature,
    excluded: VectorSignature,
    results: Vec<u32>,
}

impl Query {
    fn matches(&self, candidate: &VectorSignature) -> bool {
        self.required.is_subset_of(candidate) && !excludes_overlap(&self.excluded, candidate)
    }
}

fn excludes_overlap(excluded: &VectorSignature, candidate: &VectorSignature) -> bool {
    // `excluded` overlaps `candidate` iff some id in `excluded` is also in
    // `candidate`; reuse the subset-test primitive per-id rather than adding
    // a second merge-scan variant to `VectorSignature`.
    excluded.ids().into_iter().any(|id| candidate.contains_id(id))
}

/// A handle into the cache's `(signature, result-list)` registry. Valid for
/// the cache's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryHandle(u32);

/// Signature-indexed materialized archetype index lists.
#[derive(Default)]
pub struct QueryCache {
    queries: Vec<Query>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a query for every archetype whose signature is a superset
    /// of `required`, walking `existing_archetypes` to fill the initial
    /// result list.
    pub fn register_query(&mut self, required: VectorSignature, existing_archetypes: &[(u32, VectorSignature)]) -> QueryHandle {
        self.register_query_exclude(required, VectorSignature::from_ids(&[]), existing_archetypes)
    }

    /// As [`register_query`], but also excludes any archetype whose
    /// signature shares an id with `excluded`.
    pub fn register_query_exclude(
        &mut self,
        required: VectorSignature,
        excluded: VectorSignature,
        existing_archetypes: &[(u32, VectorSignature)],
    ) -> QueryHandle {
        let mut query = Query {
            required,
            excluded,
            results: Vec::new(),
        };
        for &(index, ref sig) in existing_archetypes {
            if query.matches(sig) {
                query.results.push(index);
            }
        }
        self.queries.push(query);
        QueryHandle((self.queries.len() - 1) as u32)
    }

    /// Tests the new archetype against every cached query, appending
    /// `archetype_index` to every query it satisfies.
    pub fn update_add(&mut self, archetype_index: u32, signature: &VectorSignature) {
        for query in &mut self.queries {
            if query.matches(signature) {
                query.results.push(archetype_index);
            }
        }
    }

    /// Removes `archetype_index` from every cached query's result list, used
    /// when an archetype is torn down entirely (not just a base within it).
    pub fn remove_archetype(&mut self, archetype_index: u32) {
        for query in &mut self.queries {
            query.results.retain(|&idx| idx != archetype_index);
        }
    }

    pub fn get_results(&self, handle: QueryHandle) -> &[u32] {
        self.queries
            .get(handle.0 as usize)
            .map(|q| q.results.as_slice())
            .unwrap_or(&[])
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }
}
