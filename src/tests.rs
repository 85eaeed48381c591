
use std::collections::BTreeSet;
use std::time::Duration;

use proptest::prelude::*;

use crate::bounds::{BoundsTable, PERCENT_UNIT};
use crate::catalog::cache::CatalogCache;
use crate::catalog::schema::LandUseRecord;
use crate::catalog::{Category, Pollutant, ReferenceCatalog};
use crate::decision_space::{DecisionSpace, Selection};
use crate::eligibility::RowKey;
use crate::error::{OptError, Result};
use crate::geography::GeographyResolver;
use crate::model::{
    BuildState, ConstraintKind, ModelBuilder, ObjectiveKind, ObjectiveSpec, OptimizationModel,
    Target,
};
use crate::results::{self, ResultExtractor, MATERIALITY_TOL};
use crate::sampler::{self, SampleMode, SamplerConfig, ScenarioSampler};
use crate::solver::{
    DualValue, SolveOptions, SolverAdapter, SolverOutput, SubprocessSolver, VariableValue,
};
use fixtures::*;

fn land_space(catalog: &ReferenceCatalog, selection: &Selection) -> DecisionSpace {
    DecisionSpace::build(catalog, selection, &[Category::Land]).unwrap()
}

fn cost_spec(targets: &[(Pollutant, f64)]) -> ObjectiveSpec {
    ObjectiveSpec::CostMinimizing {
        targets: targets
            .iter()
            .map(|&(pollutant, percent)| Target {
                segment: None,
                pollutant,
                percent,
            })
            .collect(),
    }
}

fn build_model(selection: &Selection, spec: ObjectiveSpec) -> Result<OptimizationModel> {
    let catalog = catalog();
    let space = DecisionSpace::build(&catalog, selection, &[Category::Land])?;
    ModelBuilder::new(&catalog, &space, spec).build()
}

fn segment_set(segments: &[&str]) -> BTreeSet<String> {
    segments.iter().map(|s| s.to_string()).collect()
}

fn reduction_name(segment: &str, pollutant: Pollutant) -> String {
    format!("reduction[{segment},{}]", pollutant.code())
}

#[test]
fn northumberland_county_resolves_to_its_seven_segments() {
    let catalog = catalog();
    let resolver = GeographyResolver::new(&catalog);
    let expected = segment_set(&NORTHUMBERLAND_SEGMENTS);

    let qualified = resolver
        .resolve_named("County", &["Northumberland, VA".to_string()])
        .unwrap();
    assert_eq!(qualified.segments, expected);
    assert_eq!(
        qualified.counties,
        BTreeSet::from(["Northumberland, VA".to_string()])
    );

    let bare = resolver
        .resolve_named("county", &["northumberland".to_string()])
        .unwrap();
    assert_eq!(bare.segments, expected);
}

#[test]
fn county_areas_are_or_combined_and_state_qualified() {
    let catalog = catalog();
    let resolver = GeographyResolver::new(&catalog);

    let pa = resolver
        .resolve_named("county", &["Lancaster, PA".to_string()])
        .unwrap();
    assert_eq!(pa.segments, segment_set(&[LANCASTER_PA_SEGMENT]));

    let both = resolver
        .resolve_named(
            "county",
            &["Northumberland, VA".to_string(), "Lancaster, VA".to_string()],
        )
        .unwrap();
    assert_eq!(both.segments.len(), 9);
    assert_eq!(both.counties.len(), 2);

    // Repeated calls carry no state between selections.
    let again = resolver
        .resolve_named("county", &["Lancaster, PA".to_string()])
        .unwrap();
    assert_eq!(again, pa);
}

#[test]
fn unknown_scale_fails_the_build() {
    let catalog = catalog();
    let err = DecisionSpace::build(
        &catalog,
        &selection("parish", &["Northumberland"]),
        &[Category::Land],
    )
    .unwrap_err();
    assert!(matches!(err, OptError::UnknownScale { ref scale } if scale == "parish"));
}

#[test]
fn unmatched_area_is_reference_error() {
    let catalog = catalog();
    let err = DecisionSpace::build(
        &catalog,
        &selection("county", &["Accomack, VA"]),
        &[Category::Land],
    )
    .unwrap_err();
    assert!(matches!(err, OptError::ReferenceData { .. }));
}

#[test]
fn land_practices_require_agencies() {
    let catalog = catalog();
    let mut no_agencies = county_selection();
    no_agencies.agency_codes.clear();

    let err = DecisionSpace::build(&catalog, &no_agencies, &[Category::Land]).unwrap_err();
    assert!(matches!(
        err,
        OptError::IncompleteSelection {
            category: Category::Land,
            dimension: "agency_codes"
        }
    ));

    let space = DecisionSpace::build_available(&catalog, &no_agencies).unwrap();
    let built: Vec<Category> = space.categories().collect();
    assert_eq!(built, vec![Category::Animal, Category::Manure]);
    assert!(matches!(
        space.bounds(Category::Land),
        Err(OptError::IncompleteSelection { .. })
    ));
}

#[test]
fn land_rows_follow_the_segment_agency_join() {
    let catalog = catalog();
    let space = land_space(&catalog, &county_selection());
    let rows = &space.eligibility(Category::Land).unwrap().rows;

    let federal: BTreeSet<&str> = rows
        .iter()
        .filter_map(|row| match &row.key {
            RowKey::Land { segment, agency, .. } if agency == "DoD" => Some(segment.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(federal, BTreeSet::from([FEDERAL_SEGMENT]));
    // 7 segments x 4 land uses for NonFed, plus one federal cropland row.
    assert_eq!(rows.len(), 29);
}

#[test]
fn eligible_bmps_are_deduplicated_and_exclusions_removed() {
    let catalog = catalog();
    let space = land_space(&catalog, &county_selection());

    assert_eq!(
        space.eligible_bmps(Category::Land).unwrap(),
        vec![
            "CoverCrop",
            "CoverCropLate",
            "FilterStrip",
            "NutMan",
            "PrescribedGrazing",
            "UrbanNutMan"
        ]
    );

    let rows = &space.eligibility(Category::Land).unwrap().rows;
    let cropland = rows
        .iter()
        .find(|row| row.key.loadsource() == CROPLAND)
        .unwrap();
    assert_eq!(
        cropland.bmps,
        vec!["CoverCrop", "CoverCropLate", "FilterStrip", "NutMan"]
    );

    // A row with no eligible practice is kept and contributes no cells.
    let forest = rows
        .iter()
        .find(|row| row.key.loadsource() == FOREST)
        .unwrap();
    assert!(forest.bmps.is_empty());
}

#[test]
fn unknown_load_source_is_a_hard_error() {
    let mut tables = tables();
    tables.land_use.push(LandUseRecord {
        segment: FEDERAL_SEGMENT.to_string(),
        agency: "NonFed".to_string(),
        loadsource: "Moon Dust".to_string(),
        amount: 1.0,
    });
    let err = ReferenceCatalog::from_tables(tables).unwrap_err();
    assert!(matches!(
        err,
        OptError::UnknownLoadSource { ref loadsource, .. } if loadsource == "Moon Dust"
    ));
}

#[test]
fn animal_and_manure_rows_are_county_scoped() {
    let catalog = catalog();
    let selection = selection("county", &["Northumberland, VA", "Lancaster, VA"]);
    let space = DecisionSpace::build(&catalog, &selection, &[Category::Animal, Category::Manure])
        .unwrap();

    let animal = space.eligibility(Category::Animal).unwrap();
    assert_eq!(animal.rows.len(), 2);
    assert!(animal.rows.iter().all(|row| row.bmps == vec!["AWMSDairy"]));

    let manure = space.eligibility(Category::Manure).unwrap();
    let destinations: BTreeSet<(String, Option<String>)> = manure
        .rows
        .iter()
        .filter_map(|row| match &row.key {
            RowKey::Manure {
                county_from,
                county_to,
                ..
            } => Some((county_from.clone(), county_to.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        destinations,
        BTreeSet::from([
            ("Lancaster, VA".to_string(), None),
            (
                "Lancaster, VA".to_string(),
                Some("Northumberland, VA".to_string())
            ),
            ("Northumberland, VA".to_string(), None),
            (
                "Northumberland, VA".to_string(),
                Some("Lancaster, VA".to_string())
            ),
        ])
    );

    let bounds = space.bounds(Category::Manure).unwrap();
    for (cell, b) in &bounds.cells {
        assert_eq!(b.unit, "dry tons");
        let expected = if cell.row.location() == "Northumberland, VA" { 300.0 } else { 0.0 };
        assert_eq!((b.lower, b.upper), (0.0, expected));
    }
}

#[test]
fn units_follow_precedence_and_bounds_are_sized_by_rows() {
    let catalog = catalog();
    let space = land_space(&catalog, &county_selection());
    let eligibility = space.eligibility(Category::Land).unwrap();
    let bounds = space.bounds(Category::Land).unwrap();
    assert_eq!(bounds.len(), eligibility.cell_count());

    for row in &eligibility.rows {
        for bmp in &row.bmps {
            let cell = crate::eligibility::EligibilityCell {
                row: row.key.clone(),
                bmp: bmp.clone(),
            };
            let b = space.cell_bounds(&cell).unwrap();
            if bmp == "NutMan" {
                assert_eq!(b.unit, PERCENT_UNIT);
                assert_eq!((b.lower, b.upper), (0.0, 100.0));
            } else {
                assert_eq!(b.unit, "acres");
                assert_eq!((b.lower, b.upper), (0.0, row.total_units));
            }
        }
    }
}

#[test]
fn bounds_round_trip_is_bit_identical() {
    let catalog = catalog();
    let first = land_space(&catalog, &county_selection());
    let second = land_space(&catalog, &county_selection());

    let json = first.bounds_json(Category::Land).unwrap();
    assert_eq!(json, second.bounds_json(Category::Land).unwrap());

    let restored = BoundsTable::from_json(&json).unwrap();
    let original = first.bounds(Category::Land).unwrap();
    assert_eq!(restored.category, original.category);
    assert_eq!(
        restored.cells.keys().collect::<Vec<_>>(),
        original.cells.keys().collect::<Vec<_>>()
    );
    for (a, b) in restored.cells.values().zip(original.cells.values()) {
        assert_eq!(a.unit, b.unit);
        assert_eq!(a.lower.to_bits(), b.lower.to_bits());
        assert_eq!(a.upper.to_bits(), b.upper.to_bits());
    }
}

#[test]
fn degenerate_cells_sample_to_their_constant_in_both_modes() {
    let catalog = catalog();
    let selection = selection("county", &["Northumberland, VA", "Lancaster, VA"]);
    let space = DecisionSpace::build(&catalog, &selection, &[Category::Manure]).unwrap();
    let bounds = space.bounds(Category::Manure).unwrap();

    for mode in [SampleMode::Uniform, SampleMode::LatinHypercube] {
        let config = SamplerConfig {
            mode,
            samples: 16,
            seed: 11,
        };
        let scenarios = ScenarioSampler::new(&space, config)
            .sample(Category::Manure)
            .unwrap();
        assert_eq!(scenarios.len(), 16);
        for scenario in &scenarios {
            for (cell, value) in &scenario.values {
                let b = bounds.get(cell).unwrap();
                if b.is_degenerate() {
                    assert_eq!(*value, b.lower);
                } else {
                    assert!(*value >= b.lower && *value <= b.upper);
                }
            }
        }
    }
}

#[test]
fn sampling_is_reproducible_and_leaves_the_space_untouched() {
    let catalog = catalog();
    let space = land_space(&catalog, &county_selection());
    let before = space.clone();
    let config = SamplerConfig {
        mode: SampleMode::LatinHypercube,
        samples: 10,
        seed: 42,
    };

    let a = ScenarioSampler::new(&space, config).sample(Category::Land).unwrap();
    let b = ScenarioSampler::new(&space, config).sample(Category::Land).unwrap();
    assert_eq!(a, b);
    assert_eq!(space, before);

    let none = ScenarioSampler::new(
        &space,
        SamplerConfig {
            samples: 0,
            ..config
        },
    )
    .sample(Category::Land)
    .unwrap();
    assert!(none.is_empty());

    let mut out = Vec::new();
    sampler::write_scenarios_csv(&mut out, &a[..2]).unwrap();
    let text = String::from_utf8(out).unwrap();
    let cells = space.bounds(Category::Land).unwrap().len();
    assert_eq!(text.lines().count(), 1 + 2 * cells);
    assert!(text.starts_with("scenario,category,location,row,loadsource,bmp,value"));
}

#[test]
fn cost_model_keeps_untargeted_pollutants_as_inactive_constraints() {
    let model = build_model(
        &segment_selection(FEDERAL_SEGMENT),
        cost_spec(&[
            (Pollutant::Nitrogen, 12.0),
            (Pollutant::Phosphorus, 0.0),
            (Pollutant::Sediment, 0.0),
        ]),
    )
    .unwrap();

    assert_eq!(model.state(), BuildState::Built);
    assert_eq!(model.segments(), &[FEDERAL_SEGMENT.to_string()]);

    let n = model
        .constraint(&reduction_name(FEDERAL_SEGMENT, Pollutant::Nitrogen))
        .unwrap();
    assert!(n.active);
    for p in [Pollutant::Phosphorus, Pollutant::Sediment] {
        let c = model.constraint(&reduction_name(FEDERAL_SEGMENT, p)).unwrap();
        assert!(!c.active, "{p} constraint should be present but inactive");
    }

    // Agencies collapse into one variable per (bmp, segment, loadsource).
    let cover = model
        .variables()
        .iter()
        .find(|v| v.key.bmp == "CoverCrop" && v.key.loadsource == CROPLAND)
        .unwrap();
    assert_eq!(cover.upper, 170.0);
    assert_eq!(cover.unit_cost, 45.0);

    let zero = model.zero_point();
    assert_eq!(model.objective_value(&zero), Some(0.0));
    assert!((model.max_violation(&zero) - 12.0).abs() < 1e-12);
}

#[test]
fn targets_can_be_toggled_without_rebuilding() {
    let mut model = build_model(
        &segment_selection(FEDERAL_SEGMENT),
        cost_spec(&[(Pollutant::Nitrogen, 12.0)]),
    )
    .unwrap();
    let p_name = reduction_name(FEDERAL_SEGMENT, Pollutant::Phosphorus);
    let count = model.constraints().len();

    model
        .set_target(FEDERAL_SEGMENT, Pollutant::Phosphorus, 5.0)
        .unwrap();
    assert!(model.constraint(&p_name).unwrap().active);
    assert_eq!(model.target(FEDERAL_SEGMENT, Pollutant::Phosphorus), 5.0);

    model
        .deactivate_target(FEDERAL_SEGMENT, Pollutant::Phosphorus)
        .unwrap();
    assert!(!model.constraint(&p_name).unwrap().active);
    assert_eq!(model.constraints().len(), count);

    assert!(matches!(
        model.set_target("N00000XX0_0000_0000", Pollutant::Nitrogen, 5.0),
        Err(OptError::InvalidParameter { .. })
    ));
    assert!(matches!(
        model.set_target(FEDERAL_SEGMENT, Pollutant::Nitrogen, f64::NAN),
        Err(OptError::InvalidParameter { .. })
    ));
    assert!(matches!(
        model.set_cost_ceiling(10.0),
        Err(OptError::InvalidParameter { .. })
    ));
    assert!(matches!(
        model.set_objective_pollutant(Pollutant::Sediment),
        Err(OptError::InvalidParameter { .. })
    ));
}

#[test]
fn objective_parameters_are_checked_at_build() {
    let selection = segment_selection(FEDERAL_SEGMENT);
    for cost_ceiling in [-5.0, f64::NAN, f64::INFINITY] {
        let err = build_model(
            &selection,
            ObjectiveSpec::LoadMaximizing {
                pollutant: Pollutant::Nitrogen,
                cost_ceiling,
            },
        )
        .unwrap_err();
        assert!(
            matches!(err, OptError::InvalidParameter { .. }),
            "ceiling {cost_ceiling} gave {err}"
        );
    }

    for percent in [f64::NAN, -1.0] {
        let err = build_model(&selection, cost_spec(&[(Pollutant::Nitrogen, percent)])).unwrap_err();
        match err {
            OptError::InvalidParameter { message } => {
                assert!(message.contains("nitrogen target"), "{message}");
                assert!(message.contains("every segment"), "{message}");
            }
            other => panic!("target {percent} gave {other}"),
        }
    }

    let elsewhere = ObjectiveSpec::CostMinimizing {
        targets: vec![Target {
            segment: Some(LANCASTER_PA_SEGMENT.to_string()),
            pollutant: Pollutant::Phosphorus,
            percent: 10.0,
        }],
    };
    let err = build_model(&selection, elsewhere).unwrap_err();
    match err {
        OptError::InvalidParameter { message } => assert!(message.contains(LANCASTER_PA_SEGMENT)),
        other => panic!("unexpected error {other}"),
    }

    // A failed stage leaves the builder where it was.
    let catalog = catalog();
    let space = land_space(&catalog, &selection);
    let mut builder = ModelBuilder::new(
        &catalog,
        &space,
        ObjectiveSpec::LoadMaximizing {
            pollutant: Pollutant::Nitrogen,
            cost_ceiling: -1.0,
        },
    );
    builder.load_sets().unwrap();
    assert!(builder.load_parameters().is_err());
    assert_eq!(builder.state(), BuildState::SetsLoaded);
}

#[test]
fn load_model_with_no_budget_reduces_nothing() {
    let mut model = build_model(
        &segment_selection(FEDERAL_SEGMENT),
        ObjectiveSpec::LoadMaximizing {
            pollutant: Pollutant::Nitrogen,
            cost_ceiling: 0.0,
        },
    )
    .unwrap();

    let active: Vec<_> = model.objectives().iter().filter(|o| o.active).collect();
    assert_eq!(active.len(), 1);
    assert_eq!(
        active[0].kind,
        ObjectiveKind::PercentReduction {
            pollutant: Pollutant::Nitrogen
        }
    );
    assert_eq!(model.objectives().len(), 3);

    let zero = model.zero_point();
    assert!(model.is_feasible(&zero, 1e-9));
    for p in Pollutant::ALL {
        model.set_objective_pollutant(p).unwrap();
        assert_eq!(model.objective_value(&zero), Some(0.0));
    }

    // Any practice costs money, so any nonzero point breaks the ceiling.
    let mut x = model.zero_point();
    x[0] = 1.0;
    assert!(model.variables()[0].unit_cost > 0.0);
    assert!(!model.is_feasible(&x, 1e-9));

    model.set_cost_ceiling(1_000.0).unwrap();
    assert!(model.is_feasible(&x, 1e-9));
}

#[test]
fn builder_stages_must_run_in_order() {
    let catalog = catalog();
    let space = land_space(&catalog, &segment_selection(FEDERAL_SEGMENT));
    let mut builder = ModelBuilder::new(&catalog, &space, cost_spec(&[]));

    let err = builder.load_objective().unwrap_err();
    assert!(matches!(
        err,
        OptError::ModelNotReady {
            expected: BuildState::ConstraintsLoaded,
            found: BuildState::Unbuilt
        }
    ));
    assert_eq!(builder.state(), BuildState::Unbuilt);

    builder.load_sets().unwrap();
    assert!(matches!(
        builder.load_sets(),
        Err(OptError::ModelNotReady { .. })
    ));
    builder.load_parameters().unwrap();
    builder.declare_variables().unwrap();
    assert!(matches!(
        builder.load_objective(),
        Err(OptError::ModelNotReady { .. })
    ));
    builder.load_constraints().unwrap();
    builder.load_objective().unwrap();
    assert_eq!(builder.state(), BuildState::ObjectiveLoaded);
    let model = builder.finish().unwrap();
    assert!(model.ensure_built().is_ok());
}

#[test]
fn selections_without_practices_are_empty_decision_spaces() {
    let mut natural_only = segment_selection(FEDERAL_SEGMENT);
    natural_only.sector_names = vec!["Natural".to_string()];
    let err = build_model(&natural_only, cost_spec(&[(Pollutant::Nitrogen, 5.0)])).unwrap_err();
    assert!(matches!(err, OptError::EmptyDecisionSpace { pollutant: None, .. }));

    // Urban nutrient management does nothing for sediment.
    let mut developed_only = segment_selection(FEDERAL_SEGMENT);
    developed_only.sector_names = vec!["Developed".to_string()];
    let err = build_model(&developed_only, cost_spec(&[(Pollutant::Sediment, 5.0)])).unwrap_err();
    assert!(matches!(
        err,
        OptError::EmptyDecisionSpace {
            pollutant: Some(Pollutant::Sediment),
            ..
        }
    ));
}

#[test]
fn zero_load_targets_are_accepted_and_vacuous() {
    let model = build_model(
        &segment_selection(ZERO_SEDIMENT_SEGMENT),
        cost_spec(&[(Pollutant::Sediment, 40.0)]),
    )
    .unwrap();
    assert_eq!(model.original_load(ZERO_SEDIMENT_SEGMENT, Pollutant::Sediment), 0.0);
    let c = model
        .constraint(&reduction_name(ZERO_SEDIMENT_SEGMENT, Pollutant::Sediment))
        .unwrap();
    assert!(c.active);
    assert_eq!(model.violation(c, &model.zero_point()), 0.0);
    assert!(model.is_feasible(&model.zero_point(), 0.0));
}

#[test]
fn reduced_load_at_zero_equals_original_load() {
    let model = build_model(&county_selection(), cost_spec(&[(Pollutant::Nitrogen, 5.0)])).unwrap();
    let zero = model.zero_point();
    for segment in model.segments() {
        for p in Pollutant::ALL {
            assert_eq!(
                model.reduced_load(segment, p, &zero),
                model.original_load(segment, p),
                "{segment} {p}"
            );
            assert_eq!(model.percent_reduction(segment, p, &zero), 0.0);
        }
    }
    for load in model.loads() {
        for p in Pollutant::ALL {
            assert_eq!(load.reduced_load(p, &zero), load.original_load(p));
        }
    }
}

#[test]
fn model_serializes_for_solvers() {
    let model = build_model(
        &segment_selection(FEDERAL_SEGMENT),
        cost_spec(&[(Pollutant::Nitrogen, 12.0)]),
    )
    .unwrap();
    let json: serde_json::Value = serde_json::from_str(&model.to_json().unwrap()).unwrap();
    assert_eq!(json["mode"], "cost-minimizing");
    assert_eq!(
        json["variables"].as_array().unwrap().len(),
        model.variables().len()
    );
    assert_eq!(json["cost_ceiling"], serde_json::Value::Null);
    assert!(json["constraints"]
        .as_array()
        .unwrap()
        .iter()
        .any(|c| c["kind"]["type"] == "unit-non-exceedance"));
}

#[test]
fn extractor_keeps_material_fresh_values_and_merges_duals() {
    let model = build_model(
        &segment_selection(FEDERAL_SEGMENT),
        cost_spec(&[(Pollutant::Nitrogen, 12.0)]),
    )
    .unwrap();
    let vars = model.variables();
    let value = |i: usize, value: f64, stale: bool| VariableValue {
        bmp: vars[i].key.bmp.clone(),
        segment: vars[i].key.segment.clone(),
        loadsource: vars[i].key.loadsource.clone(),
        value,
        stale,
    };
    let output = SolverOutput {
        status: "optimal".to_string(),
        objective: Some(123.0),
        variables: vec![
            value(0, 10.0, false),
            value(1, MATERIALITY_TOL / 2.0, false),
            value(2, 50.0, true),
        ],
        duals: vec![DualValue {
            bmp: vars[0].key.bmp.clone(),
            segment: vars[0].key.segment.clone(),
            loadsource: vars[0].key.loadsource.clone(),
            value: -0.5,
        }],
    };
    let snapshot = output.clone();

    let rows = ResultExtractor::new(&model).extract(&output);
    assert_eq!(output, snapshot);
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.bmp, vars[0].key.bmp);
    assert_eq!(row.amount, 10.0);
    assert_eq!(row.total_cost, vars[0].unit_cost * 10.0);
    assert_eq!(row.objective_value, Some(123.0));
    assert_eq!(row.dual, Some(-0.5));

    let mut out = Vec::new();
    results::write_csv(&mut out, &rows).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with(
        "bmp,segment_or_county,loadsource,amount,unit,unit_cost,total_cost,objective_value,dual"
    ));
    assert_eq!(text.lines().count(), 2);
}

struct ZeroSolver;

impl SolverAdapter for ZeroSolver {
    fn name(&self) -> &str {
        "zero"
    }

    async fn solve(
        &self,
        model: &OptimizationModel,
        _options: &SolveOptions,
    ) -> Result<SolverOutput> {
        model.ensure_built()?;
        let zero = model.zero_point();
        Ok(SolverOutput {
            status: "optimal".to_string(),
            objective: model.objective_value(&zero),
            variables: model
                .variables()
                .iter()
                .map(|v| VariableValue {
                    bmp: v.key.bmp.clone(),
                    segment: v.key.segment.clone(),
                    loadsource: v.key.loadsource.clone(),
                    value: 0.0,
                    stale: false,
                })
                .collect(),
            duals: Vec::new(),
        })
    }
}

#[tokio::test]
async fn zero_budget_solution_has_zero_objective_and_no_rows() {
    let model = build_model(
        &county_selection(),
        ObjectiveSpec::LoadMaximizing {
            pollutant: Pollutant::Phosphorus,
            cost_ceiling: 0.0,
        },
    )
    .unwrap();
    let output = ZeroSolver
        .solve(&model, &SolveOptions::default())
        .await
        .unwrap();
    assert_eq!(output.objective, Some(0.0));
    assert!(model.is_feasible(&output.point(&model), 1e-9));
    assert!(ResultExtractor::new(&model).extract(&output).is_empty());
}

fn script_solver(dir: &std::path::Path, script: &str) -> SubprocessSolver {
    SubprocessSolver::new("sh", dir.join("work")).with_args(["-c", script, "solver"])
}

#[tokio::test]
async fn subprocess_solver_reads_the_result_file() {
    let dir = tempfile::tempdir().unwrap();
    let model = build_model(
        &segment_selection(FEDERAL_SEGMENT),
        cost_spec(&[(Pollutant::Nitrogen, 12.0)]),
    )
    .unwrap();
    let key = &model.variables()[0].key;
    let response = serde_json::json!({
        "status": "optimal",
        "objective": 90.0,
        "variables": [
            {"bmp": key.bmp, "segment": key.segment, "loadsource": key.loadsource, "value": 2.0}
        ],
        "duals": []
    });
    let response_path = dir.path().join("response.json");
    std::fs::write(&response_path, response.to_string()).unwrap();

    let solver = script_solver(
        dir.path(),
        &format!("test -s \"$1\" && cp '{}' \"$2\"", response_path.display()),
    );
    let output = solver.solve(&model, &SolveOptions::default()).await.unwrap();
    assert_eq!(output.objective, Some(90.0));
    assert_eq!(output.point(&model)[0], 2.0);
    assert!(dir.path().join("work").join("model.json").exists());
}

#[tokio::test]
async fn subprocess_solver_reports_infeasible_and_crashes() {
    let dir = tempfile::tempdir().unwrap();
    let model = build_model(
        &segment_selection(FEDERAL_SEGMENT),
        cost_spec(&[(Pollutant::Nitrogen, 12.0)]),
    )
    .unwrap();

    let infeasible = script_solver(
        dir.path(),
        r#"printf '{"status":"infeasible"}' > "$2""#,
    );
    let err = infeasible
        .solve(&model, &SolveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OptError::SolveInfeasible { .. }));
    assert!(err.is_solve_failure());

    let crashing = script_solver(dir.path(), "echo boom >&2; exit 3");
    let err = crashing
        .solve(&model, &SolveOptions::default())
        .await
        .unwrap_err();
    match err {
        OptError::SolverFailed { message, .. } => assert!(message.contains("boom")),
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn subprocess_solver_without_readable_result_is_a_solve_failure() {
    let dir = tempfile::tempdir().unwrap();
    let model = build_model(
        &segment_selection(FEDERAL_SEGMENT),
        cost_spec(&[(Pollutant::Nitrogen, 12.0)]),
    )
    .unwrap();

    for script in ["exit 0", r#"printf 'not json' > "$2""#] {
        let err = script_solver(dir.path(), script)
            .solve(&model, &SolveOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_solve_failure(), "{script}: {err}");
        match err {
            OptError::SolverFailed { message, .. } => assert!(message.contains("result.json")),
            other => panic!("{script}: unexpected error {other}"),
        }
    }
}

#[tokio::test]
async fn subprocess_solver_times_out_and_model_stays_solvable() {
    let dir = tempfile::tempdir().unwrap();
    let model = build_model(
        &segment_selection(FEDERAL_SEGMENT),
        cost_spec(&[(Pollutant::Nitrogen, 12.0)]),
    )
    .unwrap();
    let options = SolveOptions {
        timeout: Duration::from_millis(200),
        want_duals: false,
    };

    let slow = script_solver(dir.path(), "sleep 5");
    let err = slow.solve(&model, &options).await.unwrap_err();
    assert!(matches!(err, OptError::SolveTimeout { timeout, .. } if timeout == options.timeout));

    let fast = script_solver(dir.path(), r#"printf '{"status":"optimal"}' > "$2""#);
    let output = fast.solve(&model, &options).await.unwrap();
    assert_eq!(output.status, "optimal");
}

#[test]
fn catalog_loads_from_csv_directory() {
    let dir = tempfile::tempdir().unwrap();
    write_catalog_dir(dir.path(), &tables());

    let loaded = ReferenceCatalog::from_dir(dir.path()).unwrap();
    assert_eq!(loaded.tables(), &tables());

    std::fs::remove_file(dir.path().join(crate::catalog::schema::BMPS_FILE)).unwrap();
    assert!(matches!(
        ReferenceCatalog::from_dir(dir.path()),
        Err(OptError::Io { .. })
    ));
}

#[test]
fn catalog_cache_is_keyed_by_source_content() {
    let source = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    write_catalog_dir(source.path(), &tables());
    let cache = CatalogCache::new(cache_dir.path());

    let hash = CatalogCache::source_hash(source.path()).unwrap();
    assert!(cache.load(&hash).is_none());
    let built = cache.load_or_build(source.path()).unwrap();
    assert_eq!(cache.load(&hash).as_ref(), Some(built.tables()));

    let mut edited = tables();
    edited.land_use[0].amount += 1.0;
    write_catalog_dir(source.path(), &edited);
    let new_hash = CatalogCache::source_hash(source.path()).unwrap();
    assert_ne!(hash, new_hash);
    assert!(cache.load(&new_hash).is_none());
    let rebuilt = cache.load_or_build(source.path()).unwrap();
    assert_eq!(rebuilt.tables(), &edited);

    assert_eq!(cache.invalidate().unwrap(), 2);
    assert!(cache.load(&hash).is_none());
    assert_eq!(cache.invalidate().unwrap(), 0);
}

/// Scales each random fraction onto its variable's range, then shrinks every group
/// that overshoots its cell back onto the capacity.
fn project(model: &OptimizationModel, fractions: &[f64]) -> Vec<f64> {
    let mut x: Vec<f64> = model
        .variables()
        .iter()
        .zip(fractions.iter().cycle())
        .map(|(v, f)| v.lower + f * (v.upper - v.lower))
        .collect();
    for c in model.constraints() {
        if let ConstraintKind::UnitNonExceedance { vars, capacity, .. } = &c.kind {
            let used: f64 = vars.iter().map(|&i| x[i]).sum();
            if used > *capacity && used > 0.0 {
                let factor = capacity / used;
                for &i in vars {
                    x[i] *= factor;
                }
            }
        }
    }
    x
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        .. ProptestConfig::default()
    })]

    #[test]
    fn proptest_bounds_are_ordered_for_any_land_use(
        amounts in proptest::collection::vec(0.0f64..1e6, 1..40)
    ) {
        let mut tables = tables();
        for (row, amount) in tables.land_use.iter_mut().zip(amounts.iter().cycle()) {
            row.amount = *amount;
        }
        let catalog = ReferenceCatalog::from_tables(tables).unwrap();
        let space = DecisionSpace::build(
            &catalog,
            &selection("county", &["Northumberland, VA", "Lancaster, VA"]),
            &Category::ALL,
        )
        .unwrap();
        for category in Category::ALL {
            for (cell, b) in &space.bounds(category).unwrap().cells {
                prop_assert!(b.lower <= b.upper, "{} has [{}, {}]", cell, b.lower, b.upper);
                if b.unit == PERCENT_UNIT {
                    prop_assert_eq!((b.lower, b.upper), (0.0, 100.0));
                }
            }
        }
    }

    #[test]
    fn proptest_projected_points_respect_unit_non_exceedance(
        fractions in proptest::collection::vec(0.0f64..=1.0, 1..64)
    ) {
        let model = build_model(&county_selection(), cost_spec(&[])).unwrap();
        let x = project(&model, &fractions);
        for c in model.constraints() {
            if let ConstraintKind::UnitNonExceedance { vars, capacity, .. } = &c.kind {
                let used: f64 = vars.iter().map(|&i| x[i]).sum();
                prop_assert!(used <= capacity * (1.0 + 1e-12) + 1e-12, "{} uses {} of {}", c.name, used, capacity);
            }
        }
        for segment in model.segments() {
            for p in Pollutant::ALL {
                let original = model.original_load(segment, p);
                let reduced = model.reduced_load(segment, p, &x);
                prop_assert!(reduced >= -1e-9 && reduced <= original * (1.0 + 1e-12) + 1e-12);
                let pct = model.percent_reduction(segment, p, &x);
                prop_assert!((-1e-9..=100.0 + 1e-9).contains(&pct));
            }
        }
    }

    #[test]
    fn proptest_zero_original_load_means_zero_percent(
        fractions in proptest::collection::vec(0.0f64..=1.0, 1..64)
    ) {
        let model = build_model(
            &segment_selection(ZERO_SEDIMENT_SEGMENT),
            cost_spec(&[(Pollutant::Nitrogen, 1.0)]),
        )
        .unwrap();
        let x = project(&model, &fractions);
        prop_assert_eq!(model.original_load(ZERO_SEDIMENT_SEGMENT, Pollutant::Sediment), 0.0);
        prop_assert_eq!(model.percent_reduction(ZERO_SEDIMENT_SEGMENT, Pollutant::Sediment, &x), 0.0);
    }
}
