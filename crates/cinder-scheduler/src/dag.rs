//! DAG resolution for pipeline jobs.

use cinder_core::pipeline::{JobDefinition, PipelineDefinition};
use cinder_core::{Error, JobId, Result};
use petgraph::Direction;
use petgraph::algo::{has_path_connecting, tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, Reversed};
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path};

/// Directed acyclic graph of jobs. Edges point from a dependency to its
/// dependent. Built once per run and read-only afterwards.
#[derive(Debug, Clone)]
pub struct JobGraph {
    name: String,
    variables: BTreeMap<String, String>,
    graph: DiGraph<JobDefinition, ()>,
    index: HashMap<JobId, NodeIndex>,
}

impl JobGraph {
    /// Build and validate the graph of a pipeline definition.
    pub fn build(pipeline: &PipelineDefinition) -> Result<Self> {
        Self::assemble(
            pipeline.name.clone(),
            pipeline.variables.clone(),
            pipeline.jobs.clone(),
        )
    }

    /// Build a graph from bare job definitions.
    pub fn from_jobs(jobs: Vec<JobDefinition>) -> Result<Self> {
        Self::assemble("pipeline".to_string(), BTreeMap::new(), jobs)
    }

    fn assemble(
        name: String,
        variables: BTreeMap<String, String>,
        jobs: Vec<JobDefinition>,
    ) -> Result<Self> {
        if jobs.is_empty() {
            return Err(Error::InvalidPipeline("pipeline has no jobs".into()));
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for job in jobs {
            job.validate()?;
            let id = JobId::new(&job.name);
            if index.contains_key(&id) {
                return Err(Error::InvalidPipeline(format!(
                    "job '{}' is declared more than once",
                    id
                )));
            }
            let idx = graph.add_node(job);
            index.insert(id, idx);
        }

        let mut edges = Vec::new();
        for idx in graph.node_indices() {
            let job = &graph[idx];
            for dep in &job.depends_on {
                let dep_idx = index.get(dep.as_str()).ok_or_else(|| Error::UnknownDependency {
                    job: job.name.clone(),
                    dependency: dep.clone(),
                })?;
                edges.push((*dep_idx, idx));
            }
        }
        for (from, to) in edges {
            graph.update_edge(from, to, ());
        }

        let dag = Self {
            name,
            variables,
            graph,
            index,
        };
        dag.check_acyclic()?;
        dag.check_artifacts()?;
        Ok(dag)
    }

    fn check_acyclic(&self) -> Result<()> {
        let mut cycles: Vec<Vec<String>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0])
            })
            .map(|scc| {
                let mut names: Vec<String> =
                    scc.iter().map(|&i| self.graph[i].name.clone()).collect();
                names.sort();
                names
            })
            .collect();
        cycles.sort();
        match cycles.into_iter().next() {
            Some(jobs) => Err(Error::Cycle { jobs }),
            None => Ok(()),
        }
    }

    fn check_artifacts(&self) -> Result<()> {
        for idx in self.graph.node_indices() {
            let job = &self.graph[idx];
            for output in &job.outputs {
                check_relative(&job.name, &output.path)?;
            }
            for input in &job.artifacts {
                let producer = self.index.get(input.from.as_str()).ok_or_else(|| {
                    Error::InvalidPipeline(format!(
                        "job '{}' takes artifact '{}' from unknown job '{}'",
                        job.name, input.name, input.from
                    ))
                })?;
                if !has_path_connecting(&self.graph, *producer, idx, None) || *producer == idx {
                    return Err(Error::InvalidPipeline(format!(
                        "job '{}' takes artifact '{}' from '{}', which is not upstream of it",
                        job.name, input.name, input.from
                    )));
                }
                if self.graph[*producer].output(&input.name).is_none() {
                    return Err(Error::InvalidPipeline(format!(
                        "job '{}' does not declare an output named '{}'",
                        input.from, input.name
                    )));
                }
                if let Some(path) = &input.path {
                    check_relative(&job.name, path)?;
                }
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pipeline-level variables.
    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }

    pub fn job(&self, id: &str) -> Option<&JobDefinition> {
        self.index.get(id).map(|&idx| &self.graph[idx])
    }

    /// Job definitions in declaration order.
    pub fn jobs(&self) -> impl Iterator<Item = &JobDefinition> {
        self.graph.node_indices().map(|idx| &self.graph[idx])
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs().map(|j| JobId::new(&j.name)).collect()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Jobs without dependencies.
    pub fn roots(&self) -> Vec<JobId> {
        self.sorted(
            self.graph
                .externals(Direction::Incoming)
                .collect::<Vec<_>>(),
        )
    }

    /// Direct dependencies of a job.
    pub fn dependencies(&self, id: &str) -> Vec<JobId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Jobs that directly depend on a job.
    pub fn dependents(&self, id: &str) -> Vec<JobId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Every job that transitively depends on `id`.
    pub fn downstream(&self, id: &str) -> Vec<JobId> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut bfs = Bfs::new(&self.graph, start);
        let mut found = Vec::new();
        while let Some(idx) = bfs.next(&self.graph) {
            if idx != start {
                found.push(idx);
            }
        }
        self.sorted(found)
    }

    /// Every job `id` transitively depends on.
    pub fn upstream(&self, id: &str) -> Vec<JobId> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let reversed = Reversed(&self.graph);
        let mut bfs = Bfs::new(reversed, start);
        let mut found = Vec::new();
        while let Some(idx) = bfs.next(reversed) {
            if idx != start {
                found.push(idx);
            }
        }
        self.sorted(found)
    }

    /// Whether `ancestor` is a transitive dependency of `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> bool {
        match (self.index.get(ancestor), self.index.get(descendant)) {
            (Some(&a), Some(&d)) if a != d => has_path_connecting(&self.graph, a, d, None),
            _ => false,
        }
    }

    /// Group jobs into waves. A job's wave is the length of the longest
    /// dependency chain leading to it, so every dependency sits in an
    /// earlier wave. Ids within a wave are sorted by name.
    pub fn topological_batches(&self) -> Vec<Vec<JobId>> {
        // Acyclicity is checked at build time.
        let order = toposort(&self.graph, None).unwrap_or_default();
        let mut level: HashMap<NodeIndex, usize> = HashMap::with_capacity(order.len());
        let mut batches: Vec<Vec<NodeIndex>> = Vec::new();
        for idx in order {
            let wave = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .filter_map(|dep| level.get(&dep))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level.insert(idx, wave);
            if batches.len() <= wave {
                batches.resize_with(wave + 1, Vec::new);
            }
            batches[wave].push(idx);
        }
        batches.into_iter().map(|wave| self.sorted(wave)).collect()
    }

    fn neighbors(&self, id: &str, direction: Direction) -> Vec<JobId> {
        match self.index.get(id) {
            Some(&idx) => self.sorted(self.graph.neighbors_directed(idx, direction).collect()),
            None => Vec::new(),
        }
    }

    fn sorted(&self, nodes: Vec<NodeIndex>) -> Vec<JobId> {
        let mut ids: Vec<JobId> = nodes
            .into_iter()
            .map(|idx| JobId::new(&self.graph[idx].name))
            .collect();
        ids.sort();
        ids
    }
}

fn check_relative(job: &str, path: &str) -> Result<()> {
    let escapes = Path::new(path).components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(Error::InvalidPipeline(format!(
            "job '{}': artifact path '{}' must stay inside the workspace",
            job, path
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::pipeline::{ArtifactInput, ArtifactOutput, RetryPolicy, StepDefinition};
    use std::collections::HashSet;

    fn make_job(name: &str, depends_on: &[&str]) -> JobDefinition {
        JobDefinition {
            name: name.to_string(),
            display_name: None,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            variables: Default::default(),
            steps: vec![StepDefinition {
                name: "test".to_string(),
                run: Some("echo test".to_string()),
                shell: None,
                uses: None,
                with: Default::default(),
                env: Default::default(),
                secrets: vec![],
                gate: None,
                timeout_seconds: None,
            }],
            outputs: vec![],
            artifacts: vec![],
            retry: RetryPolicy::default(),
            timeout_seconds: None,
        }
    }

    fn ids(names: &[&str]) -> Vec<JobId> {
        names.iter().map(|n| JobId::new(*n)).collect()
    }

    #[test]
    fn test_linear_dag() {
        let dag = JobGraph::from_jobs(vec![
            make_job("build", &[]),
            make_job("test", &["build"]),
            make_job("deploy", &["test"]),
        ])
        .unwrap();

        assert_eq!(dag.roots(), ids(&["build"]));
        assert_eq!(
            dag.topological_batches(),
            vec![ids(&["build"]), ids(&["test"]), ids(&["deploy"])]
        );
        assert_eq!(dag.downstream("build"), ids(&["deploy", "test"]));
        assert_eq!(dag.upstream("deploy"), ids(&["build", "test"]));
        assert!(dag.is_ancestor("build", "deploy"));
        assert!(!dag.is_ancestor("deploy", "build"));
        assert!(!dag.is_ancestor("build", "build"));
    }

    #[test]
    fn test_parallel_dag() {
        let dag = JobGraph::from_jobs(vec![
            make_job("build", &[]),
            make_job("test-unit", &["build"]),
            make_job("test-integration", &["build"]),
            make_job("lint", &[]),
            make_job("deploy", &["test-unit", "test-integration"]),
        ])
        .unwrap();

        assert_eq!(dag.dependents("build"), ids(&["test-integration", "test-unit"]));
        assert_eq!(dag.dependencies("deploy"), ids(&["test-integration", "test-unit"]));
        assert_eq!(
            dag.topological_batches(),
            vec![
                ids(&["build", "lint"]),
                ids(&["test-integration", "test-unit"]),
                ids(&["deploy"]),
            ]
        );
    }

    #[test]
    fn test_wave_uses_longest_chain() {
        // deploy depends on both a root and a second-level job.
        let dag = JobGraph::from_jobs(vec![
            make_job("build", &[]),
            make_job("test", &["build"]),
            make_job("deploy", &["build", "test"]),
        ])
        .unwrap();
        let batches = dag.topological_batches();
        assert_eq!(batches[2], ids(&["deploy"]));
    }

    #[test]
    fn test_batches_cover_every_job_once() {
        let names = ["a", "b", "c", "d", "e", "f"];
        let dag = JobGraph::from_jobs(vec![
            make_job("a", &[]),
            make_job("b", &["a"]),
            make_job("c", &["a"]),
            make_job("d", &["b", "c"]),
            make_job("e", &[]),
            make_job("f", &["e", "b"]),
        ])
        .unwrap();

        let batches = dag.topological_batches();
        let mut wave_of = HashMap::new();
        for (wave, batch) in batches.iter().enumerate() {
            for id in batch {
                assert!(wave_of.insert(id.clone(), wave).is_none());
            }
        }
        let all: HashSet<_> = wave_of.keys().map(|id| id.as_str().to_string()).collect();
        assert_eq!(all, names.iter().map(|s| s.to_string()).collect());

        for job in dag.jobs() {
            for dep in &job.depends_on {
                assert!(wave_of[dep.as_str()] < wave_of[job.name.as_str()]);
            }
        }
    }

    #[test]
    fn test_cycle_detected() {
        let err = JobGraph::from_jobs(vec![
            make_job("a", &["b"]),
            make_job("b", &["a"]),
            make_job("c", &[]),
        ])
        .unwrap_err();
        match err {
            Error::Cycle { jobs } => assert_eq!(jobs, vec!["a", "b"]),
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let err = JobGraph::from_jobs(vec![make_job("a", &["a"])]).unwrap_err();
        assert!(matches!(err, Error::Cycle { jobs } if jobs == vec!["a"]));
    }

    #[test]
    fn test_unknown_dependency() {
        let err = JobGraph::from_jobs(vec![make_job("deploy", &["scan"])]).unwrap_err();
        match err {
            Error::UnknownDependency { job, dependency } => {
                assert_eq!(job, "deploy");
                assert_eq!(dependency, "scan");
            }
            other => panic!("expected unknown dependency, got {other}"),
        }
    }

    #[test]
    fn test_duplicate_and_empty() {
        assert!(matches!(
            JobGraph::from_jobs(vec![]),
            Err(Error::InvalidPipeline(_))
        ));
        assert!(matches!(
            JobGraph::from_jobs(vec![make_job("a", &[]), make_job("a", &[])]),
            Err(Error::InvalidPipeline(_))
        ));
    }

    #[test]
    fn test_artifact_inputs_must_come_from_upstream() {
        let mut build = make_job("build", &[]);
        build.outputs.push(ArtifactOutput {
            name: "dist".into(),
            path: "dist/app.tar".into(),
        });
        let mut deploy = make_job("deploy", &["test"]);
        deploy.artifacts.push(ArtifactInput {
            from: "build".into(),
            name: "dist".into(),
            path: None,
        });
        let test = make_job("test", &["build"]);

        JobGraph::from_jobs(vec![build.clone(), test.clone(), deploy.clone()]).unwrap();

        // Not upstream.
        let sibling = make_job("test", &[]);
        let mut orphan = deploy.clone();
        orphan.depends_on = vec!["test".into()];
        let err = JobGraph::from_jobs(vec![build.clone(), sibling, orphan]).unwrap_err();
        assert!(err.to_string().contains("not upstream"));

        // Undeclared output.
        let mut wrong = deploy.clone();
        wrong.artifacts[0].name = "docs".into();
        let err = JobGraph::from_jobs(vec![build.clone(), test.clone(), wrong]).unwrap_err();
        assert!(err.to_string().contains("output named 'docs'"));

        // Escaping path.
        let mut escaping = deploy;
        escaping.artifacts[0].path = Some("../../etc/passwd".into());
        assert!(JobGraph::from_jobs(vec![build, test, escaping]).is_err());
    }

    #[test]
    fn test_build_from_definition() {
        let pipeline = PipelineDefinition::from_yaml(
            r#"
name: web-app
variables:
  NODE_ENV: production
jobs:
  - name: test
    steps:
      - name: unit
        run: npm test
  - name: deploy
    depends_on: [test]
    steps:
      - name: sync
        uses: deploy
        with:
          source: dist
          target: s3://bucket/site
"#,
        )
        .unwrap();
        let dag = JobGraph::build(&pipeline).unwrap();
        assert_eq!(dag.name(), "web-app");
        assert_eq!(dag.variables()["NODE_ENV"], "production");
        assert_eq!(dag.len(), 2);
        assert_eq!(dag.job_ids(), ids(&["test", "deploy"]));
        assert!(dag.job("deploy").is_some());
    }
}
